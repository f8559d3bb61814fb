use img_hash::{HashAlg, HasherConfig}; // 图片感知哈希 (梯度算法)
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::canonical::{CanonicalContent, ContentKind};
use crate::config::FingerprintConfig;
use crate::error::CanonicalizationError;

/// 近似签名宽度 (bit)。距离归一化时用它做分母。
pub const SIGNATURE_BITS: u32 = 64;

/// 短文档的分块窗口下限；再短的文档只有整篇签名
pub const MIN_WINDOW_TOKENS: usize = 16;

// ==========================================
// 1. 精确指纹 (Exact Digest)
// ==========================================

/// SHA-256 摘要。相等 <=> 规范字节逐字节相同。
/// JSON 中以 64 字符小写 Hex 表示。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExactDigest(pub [u8; 32]);

impl ExactDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Display for ExactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ExactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExactDigest({})", self.to_hex())
    }
}

impl Serialize for ExactDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ExactDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 64 hex chars"))
    }
}

// ==========================================
// 2. 近似签名 (Locality-Sensitive Signature)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    /// 文本：token shingle 上的 SimHash
    TextSimhash,
    /// 图片：8x8 梯度感知哈希
    ImageGradient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApproxSignature {
    pub kind: SignatureKind,
    pub bits: u64,
}

impl ApproxSignature {
    /// 汉明距离；不同类别的签名不可比，返回 None
    pub fn distance(&self, other: &Self) -> Option<u32> {
        (self.kind == other.kind).then(|| (self.bits ^ other.bits).count_ones())
    }
}

/// 一份内容的全部指纹：一个精确摘要 + 若干近似签名 (整篇 + 分块)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSet {
    pub exact: ExactDigest,
    pub approximate: Vec<ApproxSignature>,
}

// ==========================================
// 3. 指纹生成器
// ==========================================

#[derive(Debug, Clone)]
pub struct Fingerprinter {
    config: FingerprintConfig,
}

impl Fingerprinter {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    /// 确定性：相同的规范字节永远得到相同的指纹
    pub fn fingerprint(&self, content: &CanonicalContent) -> Result<FingerprintSet, CanonicalizationError> {
        let exact = ExactDigest::of(&content.bytes);
        let approximate = match content.kind {
            ContentKind::Image => vec![image_signature(&content.bytes)?],
            ContentKind::Html | ContentKind::Text => self.text_signatures(&content.tokens()),
            ContentKind::Unknown => {
                return Err(CanonicalizationError::UnsupportedContentType("unknown".to_string()))
            }
        };
        Ok(FingerprintSet { exact, approximate })
    }

    /// 整篇签名在前，之后是半窗口步长的分块签名 (用于发现局部抄袭)。
    /// 不足一个窗口的文档改用半篇长度的窗口：至少三个窗口，单处改动总会落在某个窗口之外。
    fn text_signatures(&self, tokens: &[&str]) -> Vec<ApproxSignature> {
        let shingle = self.config.shingle_size;
        let window = if tokens.len() > self.config.chunk_tokens {
            self.config.chunk_tokens
        } else {
            tokens.len() / 2
        };

        let mut bits = vec![simhash(tokens, shingle)];
        if window >= MIN_WINDOW_TOKENS.min(self.config.chunk_tokens) && tokens.len() > window {
            let stride = (window / 2).max(1);
            let mut start = 0;
            loop {
                let end = (start + window).min(tokens.len());
                bits.push(simhash(&tokens[start..end], shingle));
                if end == tokens.len() {
                    break;
                }
                start += stride;
            }
        }

        let mut signatures: Vec<ApproxSignature> = Vec::with_capacity(bits.len());
        for b in bits {
            let sig = ApproxSignature { kind: SignatureKind::TextSimhash, bits: b };
            if !signatures.contains(&sig) {
                signatures.push(sig);
            }
        }
        signatures
    }
}

/// SimHash：每个 shingle 的 64 位哈希对每一位投票 (+1 / -1)，票数为正的位置 1
pub fn simhash(tokens: &[&str], shingle_size: usize) -> u64 {
    if tokens.is_empty() {
        return 0;
    }
    let size = shingle_size.clamp(1, tokens.len());
    let mut acc = [0i32; 64];
    for window in tokens.windows(size) {
        let h = shingle_hash(window);
        for (i, slot) in acc.iter_mut().enumerate() {
            if (h >> i) & 1 == 1 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }
    acc.iter()
        .enumerate()
        .filter(|(_, v)| **v > 0)
        .fold(0u64, |out, (i, _)| out | (1u64 << i))
}

fn shingle_hash(window: &[&str]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for token in window {
        hasher.update(token.as_bytes());
        hasher.update(&[0x1f]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// 从规范图片字节 (宽 ‖ 高 ‖ RGBA8) 还原图像并计算梯度哈希
fn image_signature(canonical: &[u8]) -> Result<ApproxSignature, CanonicalizationError> {
    if canonical.len() < 8 {
        return Err(CanonicalizationError::Image("canonical image header truncated".to_string()));
    }
    let width = u32::from_be_bytes([canonical[0], canonical[1], canonical[2], canonical[3]]);
    let height = u32::from_be_bytes([canonical[4], canonical[5], canonical[6], canonical[7]]);
    let buffer = image::RgbaImage::from_raw(width, height, canonical[8..].to_vec())
        .ok_or_else(|| CanonicalizationError::Image("pixel buffer does not match dimensions".to_string()))?;
    let img = image::DynamicImage::ImageRgba8(buffer);

    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient) // 梯度算法对明暗变化比均值算法更鲁棒
        .hash_size(8, 8)
        .to_hasher();
    let hash = hasher.hash_image(&img);

    let bytes: [u8; 8] = hash
        .as_bytes()
        .try_into()
        .map_err(|_| CanonicalizationError::Image("unexpected perceptual hash width".to_string()))?;
    Ok(ApproxSignature {
        kind: SignatureKind::ImageGradient,
        bits: u64::from_be_bytes(bytes),
    })
}
