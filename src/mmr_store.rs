use ckb_merkle_mountain_range::{util::MemStore, MerkleProof, Merge, MMR};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::PersistenceError;

/// 模块：审计日志 (MMR Audit Log)
///
/// **职责**: 每条检测结果的审计叶子按时间顺序追加进 Merkle Mountain Range。
/// 只要 Root 没变，历史上任何一条结果都没有被改动过；
/// 第三方可以拿 (叶子, 位置, Proof) 对着 Root 自行验证。
///
/// - **追加优先 (Append-only)**: 只往右加叶子，不修改历史。
/// - **持久化**: 叶子哈希按位置写入 sled 树 `audit_leaves`，启动时按顺序重放重建 MMR。

/// 合并策略：父节点 = BLAKE3(左孩子 || 右孩子)
pub struct MergeBlake3;

impl Merge for MergeBlake3 {
    type Item = [u8; 32];

    fn merge(lhs: &Self::Item, rhs: &Self::Item) -> ckb_merkle_mountain_range::Result<Self::Item> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lhs);
        hasher.update(rhs);
        Ok(*hasher.finalize().as_bytes())
    }
}

pub type AuditProof = MerkleProof<[u8; 32], MergeBlake3>;

pub struct AuditLog {
    store: MemStore<[u8; 32]>,
    /// MMR 节点总数，MMR 位运算寻址的坐标系，丢了就无法定位山峰
    mmr_size: u64,
    /// 叶子位置 -> 叶子哈希
    leaves: BTreeMap<u64, [u8; 32]>,
    tree: Option<sled::Tree>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            store: MemStore::default(),
            mmr_size: 0,
            leaves: BTreeMap::new(),
            tree: None,
        }
    }

    /// 从 sled 重放已有叶子
    pub fn open(db: &sled::Db) -> Result<Self, PersistenceError> {
        let tree = db
            .open_tree("audit_leaves")
            .map_err(|e| PersistenceError::Audit(e.to_string()))?;
        let mut log = Self::in_memory();

        for entry in tree.iter() {
            let (key, value) = entry.map_err(|e| PersistenceError::Audit(e.to_string()))?;
            let stored_pos = decode_u64(&key)?;
            let leaf = <[u8; 32]>::try_from(&value[..])
                .map_err(|_| PersistenceError::Audit(format!("leaf at {stored_pos} is not 32 bytes")))?;

            let (_, pos) = log.push(leaf)?;
            if pos != stored_pos {
                return Err(PersistenceError::Audit(format!(
                    "replay diverged: leaf stored at {stored_pos} landed at {pos}"
                )));
            }
        }
        info!(leaves = log.leaves.len(), mmr_size = log.mmr_size, "🧾 审计日志重放完成");
        log.tree = Some(tree);
        Ok(log)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaf(&self, pos: u64) -> Option<[u8; 32]> {
        self.leaves.get(&pos).copied()
    }

    /// 追加一片叶子，返回 (新 Root, 叶子位置)。
    /// 先写 sled，成功后才提交到内存 MMR；写失败时 MMR 保持原样。
    pub fn append(&mut self, leaf: [u8; 32]) -> Result<([u8; 32], u64), PersistenceError> {
        let mut mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        let pos = mmr
            .push(leaf)
            .map_err(|e| PersistenceError::Audit(format!("MMR append error: {e}")))?;
        let root = mmr
            .get_root()
            .map_err(|e| PersistenceError::Audit(format!("MMR get_root error: {e}")))?;
        let new_size = mmr.mmr_size();

        if let Some(tree) = &self.tree {
            tree.insert(pos.to_be_bytes(), &leaf[..])
                .map_err(|e| PersistenceError::Audit(e.to_string()))?;
        }

        mmr.commit()
            .map_err(|e| PersistenceError::Audit(format!("MMR commit error: {e}")))?;
        self.mmr_size = new_size;
        self.leaves.insert(pos, leaf);
        Ok((root, pos))
    }

    /// 当前 Root；空日志为 None
    pub fn root(&self) -> Result<Option<[u8; 32]>, PersistenceError> {
        if self.mmr_size == 0 {
            return Ok(None);
        }
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        mmr.get_root()
            .map(Some)
            .map_err(|e| PersistenceError::Audit(format!("MMR get_root error: {e}")))
    }

    /// 开具存在性证明
    pub fn get_proof(&self, pos_list: Vec<u64>) -> Result<AuditProof, PersistenceError> {
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        mmr.gen_proof(pos_list)
            .map_err(|e| PersistenceError::Audit(format!("MMR gen_proof error: {e}")))
    }

    /// 用当前 Root 验证 `leaf` 确实位于 `pos`
    pub fn verify(&self, pos: u64, leaf: [u8; 32]) -> Result<bool, PersistenceError> {
        let Some(root) = self.root()? else {
            return Ok(false);
        };
        if !self.leaves.contains_key(&pos) {
            return Ok(false);
        }
        let proof = self.get_proof(vec![pos])?;
        proof
            .verify(root, vec![(pos, leaf)])
            .map_err(|e| PersistenceError::Audit(format!("MMR verify error: {e}")))
    }

    fn push(&mut self, leaf: [u8; 32]) -> Result<([u8; 32], u64), PersistenceError> {
        let tree = self.tree.take();
        let result = self.append(leaf);
        self.tree = tree;
        result
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, PersistenceError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PersistenceError::Audit("audit key is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}
