use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::canonical::ContentKind;
use crate::decision::{Decision, MatchKind};
use crate::error::PersistenceError;
use crate::fingerprint::FingerprintSet;

// ==========================================
// 1. 内容地址 (Content Address)
// ==========================================

/// BLAKE3(字节)。地址必须能由它指向的字节重新算出来，这就是防篡改的依据。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(pub [u8; 32]);

impl ContentAddress {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// 重新计算并比对
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self.to_hex())
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 64 hex chars"))
    }
}

// ==========================================
// 2. 检测结果 (Detection Result)
// ==========================================

/// 指向证据快照 (规范化后的内容字节)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePointer {
    pub address: ContentAddress,
    pub size: u64,
    pub content_kind: ContentKind,
}

/// 一次检测的完整结论。创建后不再修改，只追加写入账本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub id: Uuid,

    // === 第一层：对象 ===
    /// 调用方请求的 URL
    pub url: String,
    /// 跟随重定向之后的最终 URL
    pub final_url: String,
    pub content_kind: ContentKind,

    // === 第二层：指纹 ===
    /// 对规范字节计算的精确摘要 + 近似签名。
    /// 审计时对证据字节重新计算，必须与这里一致。
    pub fingerprint: FingerprintSet,

    // === 第三层：判定 ===
    pub decision: Decision,

    // === 第四层：证据与元数据 ===
    pub evidence: Option<EvidencePointer>,
    /// 调用方附带的元数据，原样保存
    pub metadata: BTreeMap<String, String>,
    pub detected_at: DateTime<Utc>,
}

// ==========================================
// 3. 存证回执 / 失败标记
// ==========================================

/// MMR 位置 + 根 + 签名 (均为 Hex)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReceipt {
    pub leaf_pos: u64,
    pub leaf_hash: String,
    pub root: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStage {
    /// 证据字节写入 blob 存储
    Blob,
    /// 结果写入账本 / 签名 / 审计日志
    Ledger,
}

/// 存证状态。失败不影响判定本身，但审计保障降级，必须显式告知调用方。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvidenceCapture {
    Recorded { receipt: AuditReceipt },
    Failed { stage: CaptureStage, error: String },
}

impl EvidenceCapture {
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// 返回给调用方的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    #[serde(flatten)]
    pub result: DetectionResult,
    pub evidence_capture: EvidenceCapture,
}

// ==========================================
// 4. 审计叶子 (签名与 MMR 的载荷)
// ==========================================

/// 参与签名和 MMR 的字段。
/// 用 BCS 编码：字段顺序固定、编码唯一，同一结果永远得到同一串字节。
/// BCS 不支持浮点，score 以百万分之一为单位存整数。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLeaf {
    pub result_id: String,
    pub url: String,
    pub exact_digest: [u8; 32],
    pub evidence_address: Option<[u8; 32]>,
    pub score_ppm: u32,
    pub verdict: bool,
    pub match_kind: MatchKind,
    pub work_id: Option<String>,
    pub detected_at_micros: i64,
}

impl AuditLeaf {
    pub fn from_result(result: &DetectionResult) -> Self {
        Self {
            result_id: result.id.to_string(),
            url: result.url.clone(),
            exact_digest: result.fingerprint.exact.0,
            evidence_address: result.evidence.as_ref().map(|e| e.address.0),
            score_ppm: (result.decision.score.clamp(0.0, 1.0) * 1_000_000.0).round() as u32,
            verdict: result.decision.verdict,
            match_kind: result.decision.match_kind,
            work_id: result.decision.work.as_ref().map(|w| w.work_id.0.clone()),
            detected_at_micros: result.detected_at.timestamp_micros(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bcs::to_bytes(self).map_err(|e| PersistenceError::Encoding(e.to_string()))
    }

    /// MMR 叶子哈希
    pub fn leaf_hash(&self) -> Result<[u8; 32], PersistenceError> {
        Ok(*blake3::hash(&self.encode()?).as_bytes())
    }
}
