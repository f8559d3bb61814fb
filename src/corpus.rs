//! 作品库索引 (Corpus Index)
//!
//! - 精确指纹：`HashMap<ExactDigest, WorkId>`，O(1) 查找。
//! - 近似签名：把 64 位签名切成 `max_distance + 1` 段 (band)，每段的值作为桶 key。
//!   鸽巢原理：两个签名汉明距离 <= max_distance 时，至少有一段完全相同，
//!   所以只查碰撞的桶就不会漏召回，也不用全表扫描。
//! - 并发：读写锁。一次注册的全部指纹在同一个写临界区内插入，查询要么全看到，要么全看不到。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::error::CorpusError;
use crate::fingerprint::{ApproxSignature, ExactDigest, FingerprintSet, SignatureKind, SIGNATURE_BITS};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub String);

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 已登记的原创作品。创建后不可变，只允许撤销 (软删除)。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub owner: String,
    pub fingerprints: Vec<FingerprintSet>,
    pub registered_at: DateTime<Utc>,
    /// 注册序号，单调递增；距离相同的候选按它排序
    pub seq: u64,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// 近似查询的候选
#[derive(Debug, Clone)]
pub struct Candidate {
    pub work: Arc<Work>,
    pub distance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BucketKey {
    kind: SignatureKind,
    band: u8,
    value: u64,
}

#[derive(Debug, Clone)]
struct Posting {
    work: WorkId,
    bits: u64,
}

#[derive(Default)]
struct IndexState {
    works: HashMap<WorkId, Arc<Work>>,
    exact: HashMap<ExactDigest, WorkId>,
    buckets: HashMap<BucketKey, Vec<Posting>>,
    next_seq: u64,
}

pub struct CorpusIndex {
    state: RwLock<IndexState>,
    /// 每段 (起始位, 位宽)
    bands: Vec<(u32, u32)>,
    max_distance: u32,
    /// 持久化树；None 表示纯内存
    tree: Option<sled::Tree>,
}

impl CorpusIndex {
    /// 纯内存索引
    pub fn in_memory(max_distance: u32) -> Self {
        let max_distance = max_distance.min(SIGNATURE_BITS - 1);
        Self {
            state: RwLock::new(IndexState::default()),
            bands: band_layout(max_distance + 1),
            max_distance,
            tree: None,
        }
    }

    /// 打开 sled 中的 `works` 树，按注册顺序重放已有作品
    pub fn open(db: &sled::Db, max_distance: u32) -> Result<Self, CorpusError> {
        let tree = db.open_tree("works")?;
        let mut index = Self::in_memory(max_distance);

        let mut works = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let work: Work = serde_json::from_slice(&value).map_err(|e| CorpusError::Storage(e.to_string()))?;
            works.push(work);
        }
        works.sort_by_key(|w| w.seq);

        {
            let state = index.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            for work in works {
                state.next_seq = state.next_seq.max(work.seq + 1);
                if work.revoked_at.is_none() {
                    insert_live(state, &index.bands, Arc::new(work));
                }
            }
            info!("📚 作品库加载完成: {} 个有效作品", state.works.len());
        }
        index.tree = Some(tree);
        Ok(index)
    }

    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }

    /// 当前有效 (未撤销) 作品数
    pub fn len(&self) -> usize {
        self.read().works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &WorkId) -> Option<Arc<Work>> {
        self.read().works.get(id).cloned()
    }

    /// 登记作品。
    ///
    /// 冲突规则：
    /// - id 已存在且未撤销 -> `WorkExists`
    /// - 某个精确摘要已绑定到其他有效作品 -> `DuplicateRegistration` (归属不明，交给调用方处理)
    pub fn register(
        &self,
        id: WorkId,
        owner: impl Into<String>,
        fingerprints: Vec<FingerprintSet>,
    ) -> Result<Arc<Work>, CorpusError> {
        let mut unique: Vec<FingerprintSet> = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            if !unique.iter().any(|u| u.exact == fp.exact) {
                unique.push(fp);
            }
        }
        if unique.is_empty() {
            return Err(CorpusError::NoFingerprints(id));
        }

        let mut state = self.write();
        if state.works.contains_key(&id) {
            return Err(CorpusError::WorkExists(id));
        }
        for fp in &unique {
            if let Some(existing) = state.exact.get(&fp.exact) {
                return Err(CorpusError::DuplicateRegistration {
                    digest: fp.exact.to_hex(),
                    existing: existing.clone(),
                });
            }
        }

        let work = Work {
            id,
            owner: owner.into(),
            fingerprints: unique,
            registered_at: Utc::now(),
            seq: state.next_seq,
            revoked_at: None,
        };

        // 先落盘再对外可见
        self.persist(&work)?;
        state.next_seq += 1;

        let work = Arc::new(work);
        insert_live(&mut state, &self.bands, Arc::clone(&work));
        info!(work_id = %work.id, seq = work.seq, fingerprints = work.fingerprints.len(), "✅ 作品登记成功");
        Ok(work)
    }

    /// 撤销作品：从所有查询中移除，并释放其精确摘要
    pub fn revoke(&self, id: &WorkId) -> Result<Arc<Work>, CorpusError> {
        let mut state = self.write();
        let current = state
            .works
            .get(id)
            .cloned()
            .ok_or_else(|| CorpusError::UnknownWork(id.clone()))?;

        let mut revoked = (*current).clone();
        revoked.revoked_at = Some(Utc::now());
        self.persist(&revoked)?;

        state.works.remove(id);
        for fp in &current.fingerprints {
            if state.exact.get(&fp.exact) == Some(id) {
                state.exact.remove(&fp.exact);
            }
        }
        let affected: Vec<BucketKey> = current
            .fingerprints
            .iter()
            .flat_map(|fp| fp.approximate.iter())
            .flat_map(|sig| bucket_keys(&self.bands, sig))
            .collect();
        for key in affected {
            if let Some(postings) = state.buckets.get_mut(&key) {
                postings.retain(|p| &p.work != id);
                if postings.is_empty() {
                    state.buckets.remove(&key);
                }
            }
        }
        info!(work_id = %id, "🗑️ 作品已撤销");
        Ok(Arc::new(revoked))
    }

    /// 精确查找
    pub fn lookup_exact(&self, digest: &ExactDigest) -> Option<Arc<Work>> {
        let state = self.read();
        state.exact.get(digest).and_then(|id| state.works.get(id)).cloned()
    }

    /// 近似查找：距离 <= max_distance (超过索引配置时取索引配置) 的候选，
    /// 每个作品只保留最小距离，按 (距离, 注册序号, id) 升序
    pub fn lookup_approximate(&self, signature: &ApproxSignature, max_distance: u32) -> Vec<Candidate> {
        let bound = max_distance.min(self.max_distance);
        let state = self.read();

        let mut best: HashMap<&WorkId, u32> = HashMap::new();
        let mut probed = 0usize;
        for key in bucket_keys(&self.bands, signature) {
            let Some(postings) = state.buckets.get(&key) else {
                continue;
            };
            for posting in postings {
                probed += 1;
                let distance = (posting.bits ^ signature.bits).count_ones();
                if distance > bound {
                    continue;
                }
                best.entry(&posting.work)
                    .and_modify(|d| *d = (*d).min(distance))
                    .or_insert(distance);
            }
        }

        let mut candidates: Vec<Candidate> = best
            .into_iter()
            .filter_map(|(id, distance)| {
                state.works.get(id).map(|work| Candidate {
                    work: Arc::clone(work),
                    distance,
                })
            })
            .collect();
        sort_candidates(&mut candidates);
        debug!(probed, matched = candidates.len(), bound, "近似查询完成");
        candidates
    }

    fn persist(&self, work: &Work) -> Result<(), CorpusError> {
        if let Some(tree) = &self.tree {
            let value = serde_json::to_vec(work).map_err(|e| CorpusError::Storage(e.to_string()))?;
            tree.insert(work.id.0.as_bytes(), value)?;
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        // 写入方在校验通过后才修改状态，中途不会 panic，中毒时状态仍一致
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 合并多路查询结果：同一作品取最小距离后重新排序
pub fn merge_candidates(lists: impl IntoIterator<Item = Vec<Candidate>>) -> Vec<Candidate> {
    let mut best: HashMap<WorkId, Candidate> = HashMap::new();
    for candidate in lists.into_iter().flatten() {
        match best.get_mut(&candidate.work.id) {
            Some(existing) if existing.distance <= candidate.distance => {}
            Some(existing) => *existing = candidate,
            None => {
                best.insert(candidate.work.id.clone(), candidate);
            }
        }
    }
    let mut merged: Vec<Candidate> = best.into_values().collect();
    sort_candidates(&mut merged);
    merged
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.work.seq.cmp(&b.work.seq))
            .then_with(|| a.work.id.cmp(&b.work.id))
    });
}

fn insert_live(state: &mut IndexState, bands: &[(u32, u32)], work: Arc<Work>) {
    let mut seen: HashSet<(SignatureKind, u64)> = HashSet::new();
    for fp in &work.fingerprints {
        state.exact.insert(fp.exact, work.id.clone());
        for sig in &fp.approximate {
            if !seen.insert((sig.kind, sig.bits)) {
                continue;
            }
            for key in bucket_keys(bands, sig) {
                state.buckets.entry(key).or_default().push(Posting {
                    work: work.id.clone(),
                    bits: sig.bits,
                });
            }
        }
    }
    state.works.insert(work.id.clone(), work);
}

/// 把 64 位均分成 `count` 段，前 `64 % count` 段多 1 位
fn band_layout(count: u32) -> Vec<(u32, u32)> {
    let count = count.clamp(1, SIGNATURE_BITS);
    let base = SIGNATURE_BITS / count;
    let extra = SIGNATURE_BITS % count;
    let mut start = 0;
    (0..count)
        .map(|i| {
            let width = base + u32::from(i < extra);
            let band = (start, width);
            start += width;
            band
        })
        .collect()
}

fn bucket_keys<'a>(bands: &'a [(u32, u32)], sig: &'a ApproxSignature) -> impl Iterator<Item = BucketKey> + 'a {
    bands.iter().enumerate().map(move |(i, &(start, width))| {
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        BucketKey {
            kind: sig.kind,
            band: i as u8,
            value: (sig.bits >> start) & mask,
        }
    })
}
