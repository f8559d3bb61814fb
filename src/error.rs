//! 错误分类 (Error Taxonomy)
//!
//! 每个组件一个错误枚举，顶层 `DetectError` / `RegisterError` 通过 `#[from]` 汇总。
//! 约定：`Err` 永远表示“无法判定”，`Ok` + `verdict: false` 才表示“判定为未侵权”，两者不能混用。

use thiserror::Error;

use crate::corpus::WorkId;

// ==========================================
// 1. 抓取错误 (Fetcher)
// ==========================================

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect failure for {url}: {message}")]
    Connect { url: String, message: String },

    #[error("fetch of {url} timed out after {elapsed_ms} ms")]
    Timeout { url: String, elapsed_ms: u64 },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} blocked: {reason}")]
    Blocked { url: String, reason: String },

    #[error("render service failed for {url}: {message}")]
    Render { url: String, message: String },

    #[error("reading body of {url} failed: {message}")]
    Body { url: String, message: String },

    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

/// 稳定的错误类别标签，序列化为 snake_case 供调用方分支判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    InvalidUrl,
    ConnectFailure,
    Timeout,
    HttpStatus,
    Blocked,
    RenderFailure,
    Body,
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::InvalidUrl { .. } => FetchErrorKind::InvalidUrl,
            Self::Connect { .. } => FetchErrorKind::ConnectFailure,
            Self::Timeout { .. } => FetchErrorKind::Timeout,
            Self::Status { .. } => FetchErrorKind::HttpStatus,
            Self::Blocked { .. } => FetchErrorKind::Blocked,
            Self::Render { .. } => FetchErrorKind::RenderFailure,
            Self::Body { .. } => FetchErrorKind::Body,
            Self::Cancelled { .. } => FetchErrorKind::Cancelled,
        }
    }

    /// 暂时性错误：连接失败、单次超时、5xx / 429、渲染服务失败。
    /// 其余 (4xx、非法 URL、robots 拦截、超大响应体、取消) 一律立即失败。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } | Self::Render { .. } => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::InvalidUrl { .. }
            | Self::Blocked { .. }
            | Self::Body { .. }
            | Self::Cancelled { .. } => false,
        }
    }
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::ConnectFailure => "connect_failure",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::Blocked => "blocked",
            Self::RenderFailure => "render_failure",
            Self::Body => "body",
            Self::Cancelled => "cancelled",
        }
    }
}

// ==========================================
// 2. 规范化错误 (Canonicalizer)
// ==========================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalizationError {
    #[error("content is not decodable as {expected}: {detail}")]
    Undecodable { expected: String, detail: String },

    #[error("content has no fingerprintable tokens")]
    Empty,

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("image decode failed: {0}")]
    Image(String),
}

// ==========================================
// 3. 作品库错误 (Corpus Index)
// ==========================================

#[derive(Debug, Error)]
pub enum CorpusError {
    /// 同一个精确指纹已经绑定在另一个作品上 (归属不明)，由调用方决定是否先撤销再注册
    #[error("exact fingerprint {digest} is already registered to work '{existing}'")]
    DuplicateRegistration { digest: String, existing: WorkId },

    #[error("work '{0}' is already registered")]
    WorkExists(WorkId),

    #[error("work '{0}' is not registered")]
    UnknownWork(WorkId),

    #[error("no fingerprints supplied for work '{0}'")]
    NoFingerprints(WorkId),

    #[error("corpus storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for CorpusError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

// ==========================================
// 4. 持久化错误 (Evidence Recorder)
// ==========================================

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("blob store error: {0}")]
    Blob(String),

    #[error("result ledger error: {0}")]
    Ledger(String),

    #[error("audit log error: {0}")]
    Audit(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("content address mismatch: expected {expected}, computed {actual}")]
    AddressMismatch { expected: String, actual: String },

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<sled::Error> for PersistenceError {
    fn from(err: sled::Error) -> Self {
        Self::Ledger(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

// ==========================================
// 5. 顶层错误 (Detect / RegisterWork)
// ==========================================

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl DetectError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(err) => err.kind().as_str(),
            Self::Canonicalization(_) => "canonicalization",
            Self::Task(_) => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("reading source {path} failed: {message}")]
    Source { path: String, message: String },

    #[error("background task failed: {0}")]
    Task(String),
}

impl RegisterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(err) => err.kind().as_str(),
            Self::Canonicalization(_) => "canonicalization",
            Self::Corpus(CorpusError::DuplicateRegistration { .. }) => "duplicate_registration",
            Self::Corpus(CorpusError::WorkExists(_)) => "work_exists",
            Self::Corpus(CorpusError::NoFingerprints(_)) => "no_fingerprints",
            Self::Corpus(_) => "corpus",
            Self::Source { .. } => "source",
            Self::Task(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_subset_matches_status_classes() {
        let status = |code| FetchError::Status { url: "u".into(), status: code };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!FetchError::Cancelled { url: "u".into() }.is_retryable());
        assert!(FetchError::Connect { url: "u".into(), message: "refused".into() }.is_retryable());
    }

    #[test]
    fn kind_tags_are_snake_case() {
        let err = DetectError::from(FetchError::Connect { url: "u".into(), message: "x".into() });
        assert_eq!(err.kind(), "connect_failure");
        let json = serde_json::to_string(&FetchErrorKind::ConnectFailure).unwrap();
        assert_eq!(json, "\"connect_failure\"");
    }
}
