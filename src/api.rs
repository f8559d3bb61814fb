use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::corpus::{Work, WorkId};
use crate::error::{CorpusError, DetectError, FetchError, PersistenceError, RegisterError};
use crate::evidence::DetectionReport;
use crate::fetcher::PageSource;
use crate::pipeline::{ContentSource, DetectOptions, Detector};
use crate::recorder::{AuditProofView, EvidenceVerification, StoredResult};

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 所有请求共享同一个 Detector；作品库和审计日志各自带锁，这里不再套 Mutex。
pub struct AppState<S> {
    pub detector: Arc<Detector<S>>,
}

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Deserialize)]
pub struct DetectRequest {
    pub url: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// HTTP 只接受 URL 和请求体里的内容；服务端本地文件只能走库接口
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRequest {
    Url(String),
    /// 文本内容
    Inline {
        content: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    /// 任意字节 (图片、非 UTF-8 页面)，标准 base64
    Bytes {
        content_base64: String,
        #[serde(default)]
        content_type: Option<String>,
    },
}

impl TryFrom<SourceRequest> for ContentSource {
    type Error = ApiError;

    fn try_from(req: SourceRequest) -> Result<Self, Self::Error> {
        Ok(match req {
            SourceRequest::Url(url) => Self::Url(url),
            SourceRequest::Inline { content, content_type } => Self::Inline {
                bytes: content.into_bytes(),
                content_type,
            },
            SourceRequest::Bytes {
                content_base64,
                content_type,
            } => {
                let bytes = general_purpose::STANDARD.decode(content_base64.trim()).map_err(|e| {
                    ApiError::new(StatusCode::BAD_REQUEST, "rejected", "invalid_base64", e.to_string())
                })?;
                Self::Inline { bytes, content_type }
            }
        })
    }
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub work_id: String,
    pub owner: String,
    pub sources: Vec<SourceRequest>,
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub works: usize,
    pub audit_root: Option<String>,
    pub public_key: String,
}

// 失败响应：和 200 + verdict=false 明确区分
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error_kind: String,
    pub message: String,
}

pub struct ApiError {
    code: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(code: StatusCode, status: &'static str, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            body: ErrorBody {
                status,
                error_kind: kind.into(),
                message: message.into(),
            },
        }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "error", "not_found", what)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code, Json(self.body)).into_response()
    }
}

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        let code = match &err {
            DetectError::Fetch(FetchError::InvalidUrl { .. }) => StatusCode::BAD_REQUEST,
            DetectError::Fetch(FetchError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            DetectError::Fetch(_) => StatusCode::BAD_GATEWAY,
            DetectError::Canonicalization(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DetectError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(code, "undetermined", err.kind(), err.to_string())
    }
}

impl From<RegisterError> for ApiError {
    fn from(err: RegisterError) -> Self {
        let code = match &err {
            RegisterError::Corpus(CorpusError::DuplicateRegistration { .. } | CorpusError::WorkExists(_)) => {
                StatusCode::CONFLICT
            }
            RegisterError::Corpus(CorpusError::Storage(_)) | RegisterError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RegisterError::Fetch(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(code, "rejected", err.kind(), err.to_string())
    }
}

impl From<CorpusError> for ApiError {
    fn from(err: CorpusError) -> Self {
        match err {
            CorpusError::UnknownWork(id) => Self::not_found(format!("work '{id}' is not registered")),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "error", "corpus", other.to_string()),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "error", "persistence", err.to_string())
    }
}

// ==========================================
// 3. API 路由构建
// ==========================================
pub fn app<S: PageSource>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(health::<S>))
        .route("/detect", post(detect::<S>))
        .route("/works", post(register_work::<S>))
        .route("/works/{id}", delete(revoke_work::<S>))
        .route("/works/{id}/results", get(work_results::<S>))
        .route("/results", get(results_between::<S>))
        .route("/results/{id}/verify", get(verify_result::<S>))
        .route("/audit/{pos}", get(get_audit_proof::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

async fn health<S: PageSource>(State(state): State<Arc<AppState<S>>>) -> Result<Json<HealthResponse>, ApiError> {
    let recorder = state.detector.recorder();
    Ok(Json(HealthResponse {
        status: "ok",
        works: state.detector.corpus().len(),
        audit_root: recorder.audit_root()?.map(hex::encode),
        public_key: hex::encode(recorder.signer().public_key().to_bytes()),
    }))
}

/// 客户端断开时 axum 丢弃这个 future，进行中的抓取随之取消
async fn detect<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<DetectRequest>,
) -> Result<Json<DetectionReport>, ApiError> {
    info!("📥 收到检测请求: url={}", req.url);
    let options = DetectOptions {
        metadata: req.metadata,
        cancel: None,
    };
    let report = state.detector.detect(&req.url, options).await?;
    Ok(Json(report))
}

async fn register_work<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Work>), ApiError> {
    info!("📥 收到作品登记: work_id={}, sources={}", req.work_id, req.sources.len());
    let sources = req
        .sources
        .into_iter()
        .map(ContentSource::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let work = state
        .detector
        .register_work(WorkId(req.work_id), req.owner, sources)
        .await?;
    Ok((StatusCode::CREATED, Json(work.as_ref().clone())))
}

async fn revoke_work<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Work>, ApiError> {
    let work = state.detector.revoke_work(&WorkId(id))?;
    Ok(Json(work.as_ref().clone()))
}

async fn work_results<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StoredResult>>, ApiError> {
    Ok(Json(state.detector.recorder().results_for_work(&id)?))
}

async fn results_between<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<StoredResult>>, ApiError> {
    let from = range.from.unwrap_or_default();
    let to = range.to.unwrap_or_else(Utc::now);
    Ok(Json(state.detector.recorder().results_between(from, to)?))
}

async fn verify_result<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EvidenceVerification>, ApiError> {
    info!("🔍 收到复核请求: result_id={}", id);
    state
        .detector
        .recorder()
        .verify_evidence(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("result {id} not found")))
}

/// 接口：获取审计证明
async fn get_audit_proof<S: PageSource>(
    State(state): State<Arc<AppState<S>>>,
    Path(pos): Path<u64>,
) -> Result<Json<AuditProofView>, ApiError> {
    info!("🔍 收到审计请求: Pos={}", pos);
    state
        .detector
        .recorder()
        .audit_proof(pos)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no audit leaf at position {pos}")))
}
