//! 存证记录器 (Evidence Recorder)
//!
//! 每条检测结果落三处：
//! 1. 证据字节 -> `BlobStore` (内容寻址)
//! 2. 结果本身 -> sled 账本 (按 id / 时间 / 作品三个索引，同一事务写入)
//! 3. 审计叶子 -> Ed25519 签名 + MMR 追加
//!
//! 账本只追加：同一个 id 再次 `record` 直接返回已有回执。

use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::canonical::ContentKind;
use crate::error::PersistenceError;
use crate::evidence::{AuditLeaf, AuditReceipt, ContentAddress, DetectionResult, EvidencePointer};
use crate::fingerprint::ExactDigest;
use crate::mmr_store::AuditLog;
use crate::signer::EvidenceSigner;

/// 账本里的一行：结果 + 当时开出的回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub result: DetectionResult,
    pub receipt: AuditReceipt,
}

/// 某个位置的 MMR 存在性证明 (Hex)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditProofView {
    pub leaf_pos: u64,
    pub leaf_hash: String,
    pub root: String,
    pub mmr_size: u64,
    pub proof_items: Vec<String>,
}

/// 对一条历史结果的复核
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceVerification {
    pub result_id: Uuid,
    /// 证据字节还在，且重新计算的地址 / 精确摘要与结果一致
    pub evidence_intact: bool,
    /// 账本里的结果重新编码后与签名、叶子哈希一致
    pub signature_valid: bool,
    /// 叶子仍然位于 MMR 的记录位置
    pub audit_included: bool,
    pub valid: bool,
}

pub struct EvidenceRecorder {
    blobs: Arc<dyn BlobStore>,
    results: sled::Tree,
    by_time: sled::Tree,
    by_work: sled::Tree,
    audit: Mutex<AuditLog>,
    signer: Arc<EvidenceSigner>,
}

impl EvidenceRecorder {
    pub fn open(
        db: &sled::Db,
        blobs: Arc<dyn BlobStore>,
        signer: Arc<EvidenceSigner>,
    ) -> Result<Self, PersistenceError> {
        let recorder = Self {
            blobs,
            results: db.open_tree("results")?,
            by_time: db.open_tree("results_by_time")?,
            by_work: db.open_tree("results_by_work")?,
            audit: Mutex::new(AuditLog::open(db)?),
            signer,
        };
        info!(results = recorder.results.len(), "📒 结果账本已打开");
        Ok(recorder)
    }

    pub fn signer(&self) -> &EvidenceSigner {
        &self.signer
    }

    pub fn audit_root(&self) -> Result<Option<[u8; 32]>, PersistenceError> {
        self.audit_log().root()
    }

    /// 写入证据字节，返回指针。地址由存储层算出后再核对一次。
    pub fn store_evidence(&self, kind: ContentKind, bytes: &[u8]) -> Result<EvidencePointer, PersistenceError> {
        let address = self.blobs.put(bytes)?;
        let expected = ContentAddress::of(bytes);
        if address != expected {
            return Err(PersistenceError::AddressMismatch {
                expected: expected.to_hex(),
                actual: address.to_hex(),
            });
        }
        Ok(EvidencePointer {
            address,
            size: bytes.len() as u64,
            content_kind: kind,
        })
    }

    /// 签名 + 追加审计日志 + 写账本。
    pub fn record(&self, result: &DetectionResult) -> Result<AuditReceipt, PersistenceError> {
        let id_key = result.id.as_bytes().to_vec();
        let leaf = AuditLeaf::from_result(result);
        let leaf_hash = leaf.leaf_hash()?;
        let signature = self.signer.sign(&leaf)?;

        // 审计日志锁贯穿整个写入，保证 MMR 顺序与账本顺序一致
        let mut audit = self.audit_log();
        if let Some(existing) = self.results.get(&id_key)? {
            let stored: StoredResult = serde_json::from_slice(&existing)?;
            return Ok(stored.receipt);
        }

        let (root, leaf_pos) = audit.append(leaf_hash)?;
        let receipt = AuditReceipt {
            leaf_pos,
            leaf_hash: hex::encode(leaf_hash),
            root: hex::encode(root),
            signature: hex::encode(signature.to_bytes()),
        };
        let value = serde_json::to_vec(&StoredResult {
            result: result.clone(),
            receipt: receipt.clone(),
        })?;

        let time_key = time_key(result.detected_at, &result.id);
        let work_key = result
            .decision
            .work
            .as_ref()
            .map(|w| [work_prefix(&w.work_id.0), time_key.clone()].concat());

        (&self.results, &self.by_time, &self.by_work)
            .transaction(|(results, by_time, by_work)| {
                results.insert(id_key.as_slice(), value.as_slice())?;
                by_time.insert(time_key.as_slice(), &b""[..])?;
                if let Some(key) = &work_key {
                    by_work.insert(key.as_slice(), &b""[..])?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                warn!(result_id = %result.id, leaf_pos, "账本写入失败，审计叶子已追加");
                PersistenceError::Ledger(format!("{e:?}"))
            })?;

        info!(
            result_id = %result.id,
            leaf_pos,
            verdict = result.decision.verdict,
            "📝 检测结果已存证"
        );
        Ok(receipt)
    }

    pub fn result(&self, id: &Uuid) -> Result<Option<StoredResult>, PersistenceError> {
        match self.results.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// `[from, to]` 闭区间，按检测时间升序
    pub fn results_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredResult>, PersistenceError> {
        if from > to {
            return Ok(Vec::new());
        }
        let start = time_prefix(from).to_be_bytes().to_vec();
        let entries: Vec<_> = match time_prefix(to).checked_add(1) {
            Some(end) => self.by_time.range(start..end.to_be_bytes().to_vec()).collect(),
            None => self.by_time.range(start..).collect(),
        };
        self.load_by_index_keys(entries)
    }

    /// 命中某作品的全部结果，按检测时间升序
    pub fn results_for_work(&self, work_id: &str) -> Result<Vec<StoredResult>, PersistenceError> {
        let entries: Vec<_> = self.by_work.scan_prefix(work_prefix(work_id)).collect();
        self.load_by_index_keys(entries)
    }

    pub fn audit_proof(&self, leaf_pos: u64) -> Result<Option<AuditProofView>, PersistenceError> {
        let audit = self.audit_log();
        let Some(leaf) = audit.leaf(leaf_pos) else {
            return Ok(None);
        };
        let Some(root) = audit.root()? else {
            return Ok(None);
        };
        let proof = audit.get_proof(vec![leaf_pos])?;
        Ok(Some(AuditProofView {
            leaf_pos,
            leaf_hash: hex::encode(leaf),
            root: hex::encode(root),
            mmr_size: proof.mmr_size(),
            proof_items: proof.proof_items().iter().map(hex::encode).collect(),
        }))
    }

    /// 复核：重读证据字节重新算地址和摘要，重新编码验签，再对 MMR 验证存在性
    pub fn verify_evidence(&self, result_id: &Uuid) -> Result<Option<EvidenceVerification>, PersistenceError> {
        let Some(stored) = self.result(result_id)? else {
            return Ok(None);
        };
        let result = &stored.result;

        let evidence_intact = match &result.evidence {
            Some(pointer) => match self.blobs.get(&pointer.address)? {
                Some(bytes) => {
                    pointer.address.matches(&bytes) && ExactDigest::of(&bytes) == result.fingerprint.exact
                }
                None => false,
            },
            None => false,
        };

        let leaf = AuditLeaf::from_result(result);
        let leaf_hash = leaf.leaf_hash()?;
        let signature_valid = hex::encode(leaf_hash) == stored.receipt.leaf_hash
            && match decode_signature(&stored.receipt.signature) {
                Some(signature) => EvidenceSigner::verify(&self.signer.public_key(), &leaf, &signature)?,
                None => false,
            };

        let audit_included = self.audit_log().verify(stored.receipt.leaf_pos, leaf_hash)?;

        let verification = EvidenceVerification {
            result_id: *result_id,
            evidence_intact,
            signature_valid,
            audit_included,
            valid: evidence_intact && signature_valid && audit_included,
        };
        if !verification.valid {
            warn!(result_id = %result_id, ?verification, "⚠️ 证据复核未通过");
        }
        Ok(Some(verification))
    }

    fn load_by_index_keys(
        &self,
        entries: Vec<sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> Result<Vec<StoredResult>, PersistenceError> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let (key, _) = entry?;
            let id = id_suffix(&key)?;
            if let Some(stored) = self.result(&id)? {
                out.push(stored);
            }
        }
        Ok(out)
    }

    fn audit_log(&self) -> std::sync::MutexGuard<'_, AuditLog> {
        self.audit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 时间前缀：i64 微秒翻转符号位，负数时间也保持字节序 = 时间序
fn time_prefix(at: DateTime<Utc>) -> u64 {
    (at.timestamp_micros() as u64) ^ (1 << 63)
}

fn time_key(at: DateTime<Utc>, id: &Uuid) -> Vec<u8> {
    let mut key = time_prefix(at).to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// `len(u32 BE) ‖ work_id`：长度前缀让任意字节的 id 都不会互为前缀
fn work_prefix(work_id: &str) -> Vec<u8> {
    let id = work_id.as_bytes();
    let mut key = Vec::with_capacity(4 + id.len());
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn id_suffix(key: &[u8]) -> Result<Uuid, PersistenceError> {
    if key.len() < 16 {
        return Err(PersistenceError::Ledger("index key too short".to_string()));
    }
    Uuid::from_slice(&key[key.len() - 16..]).map_err(|e| PersistenceError::Ledger(e.to_string()))
}

fn decode_signature(hex_sig: &str) -> Option<Signature> {
    let bytes: [u8; 64] = hex::decode(hex_sig).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}
