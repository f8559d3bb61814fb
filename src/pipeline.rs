//! 检测流水线
//!
//! 抓取 -> 规范化 -> 指纹 -> 作品库查询 -> 判定 -> 存证
//!
//! 存证失败不会吞掉判定：报告里带 `evidence_capture: failed`。
//! 抓取 / 规范化失败才返回 `Err` (无法判定)。

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::canonical::{canonicalize_with_budget, CanonicalContent, ContentKind};
use crate::corpus::{merge_candidates, CorpusIndex, Work, WorkId};
use crate::decision::DecisionEngine;
use crate::error::{CanonicalizationError, CorpusError, DetectError, FetchError, RegisterError};
use crate::evidence::{CaptureStage, DetectionReport, DetectionResult, EvidenceCapture};
use crate::fetcher::{Fetcher, PageSource};
use crate::fingerprint::{FingerprintSet, Fingerprinter};
use crate::recorder::EvidenceRecorder;

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// 原样写入结果
    pub metadata: BTreeMap<String, String>,
    pub cancel: Option<CancellationToken>,
}

/// 作品登记的内容来源
#[derive(Debug, Clone)]
pub enum ContentSource {
    Url(String),
    File(PathBuf),
    Inline {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
}

pub struct Detector<S> {
    fetcher: Fetcher<S>,
    fingerprinter: Fingerprinter,
    corpus: Arc<CorpusIndex>,
    engine: DecisionEngine,
    recorder: Arc<EvidenceRecorder>,
}

impl<S: PageSource> Detector<S> {
    pub fn new(
        fetcher: Fetcher<S>,
        fingerprinter: Fingerprinter,
        corpus: Arc<CorpusIndex>,
        engine: DecisionEngine,
        recorder: Arc<EvidenceRecorder>,
    ) -> Self {
        Self {
            fetcher,
            fingerprinter,
            corpus,
            engine,
            recorder,
        }
    }

    pub fn corpus(&self) -> &CorpusIndex {
        &self.corpus
    }

    pub fn recorder(&self) -> &EvidenceRecorder {
        &self.recorder
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub async fn detect(&self, url: &str, options: DetectOptions) -> Result<DetectionReport, DetectError> {
        let cancel = options.cancel.unwrap_or_default();
        let fetched = self.fetcher.fetch(url, &cancel).await?;

        let (canonical, fingerprint) = self
            .fingerprint_blocking(fetched.body, fetched.kind, fetched.content_type)
            .await
            .map_err(|e| match e {
                BlockingError::Canonicalization(err) => DetectError::Canonicalization(err),
                BlockingError::Join(msg) => DetectError::Task(msg),
            })?;

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled { url: url.to_string() }.into());
        }

        // ==========================================
        // 查询 + 判定
        // ==========================================
        let max_distance = self.engine.policy().max_distance;
        let exact = self.corpus.lookup_exact(&fingerprint.exact);
        let candidates = merge_candidates(
            fingerprint
                .approximate
                .iter()
                .map(|sig| self.corpus.lookup_approximate(sig, max_distance)),
        );
        let decision = self.engine.decide(exact.as_deref(), &candidates);
        info!(
            url = %url,
            score = decision.score,
            verdict = decision.verdict,
            match_kind = ?decision.match_kind,
            work_id = decision.work.as_ref().map(|w| w.work_id.0.as_str()).unwrap_or("-"),
            "⚖️ 判定完成"
        );

        // ==========================================
        // 存证 (同步 sled 写入放到阻塞线程)
        // 调用方中途放弃时阻塞任务仍会跑完，结果由 persist 自己记日志
        // ==========================================
        let result = DetectionResult {
            id: Uuid::new_v4(),
            url: fetched.requested_url.to_string(),
            final_url: fetched.final_url.to_string(),
            content_kind: canonical.kind,
            fingerprint,
            decision,
            evidence: None,
            metadata: options.metadata,
            detected_at: Utc::now(),
        };
        let recorder = Arc::clone(&self.recorder);
        tokio::task::spawn_blocking(move || persist(&recorder, result, &canonical))
            .await
            .map_err(|e| DetectError::Task(e.to_string()))
    }

    /// 登记作品：每个来源各自规范化、取指纹，整体一次性写入作品库
    pub async fn register_work(
        &self,
        work_id: WorkId,
        owner: impl Into<String>,
        sources: Vec<ContentSource>,
    ) -> Result<Arc<Work>, RegisterError> {
        if sources.is_empty() {
            return Err(CorpusError::NoFingerprints(work_id).into());
        }

        let mut fingerprints = Vec::with_capacity(sources.len());
        for source in sources {
            let (bytes, kind, content_type) = self.load_source(source).await?;
            let (_, fingerprint) = self
                .fingerprint_blocking(bytes, kind, content_type)
                .await
                .map_err(|e| match e {
                    BlockingError::Canonicalization(err) => RegisterError::Canonicalization(err),
                    BlockingError::Join(msg) => RegisterError::Task(msg),
                })?;
            fingerprints.push(fingerprint);
        }

        let work = self.corpus.register(work_id, owner, fingerprints)?;
        Ok(work)
    }

    pub fn revoke_work(&self, work_id: &WorkId) -> Result<Arc<Work>, CorpusError> {
        self.corpus.revoke(work_id)
    }

    async fn load_source(
        &self,
        source: ContentSource,
    ) -> Result<(Vec<u8>, ContentKind, Option<String>), RegisterError> {
        match source {
            ContentSource::Url(url) => {
                let fetched = self.fetcher.fetch(&url, &CancellationToken::new()).await?;
                Ok((fetched.body, fetched.kind, fetched.content_type))
            }
            ContentSource::File(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| RegisterError::Source {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                let kind = ContentKind::classify(None, &bytes);
                Ok((bytes, kind, None))
            }
            ContentSource::Inline { bytes, content_type } => {
                let kind = ContentKind::classify(content_type.as_deref(), &bytes);
                Ok((bytes, kind, content_type))
            }
        }
    }

    /// 规范化和指纹都是 CPU 密集，放到阻塞线程池
    async fn fingerprint_blocking(
        &self,
        body: Vec<u8>,
        kind: ContentKind,
        content_type: Option<String>,
    ) -> Result<(CanonicalContent, FingerprintSet), BlockingError> {
        let fingerprinter = self.fingerprinter.clone();
        tokio::task::spawn_blocking(move || {
            let max_pixels = fingerprinter.config().max_image_pixels;
            let canonical = canonicalize_with_budget(&body, kind, content_type.as_deref(), max_pixels)?;
            let fingerprint = fingerprinter.fingerprint(&canonical)?;
            Ok::<_, CanonicalizationError>((canonical, fingerprint))
        })
        .await
        .map_err(|e| BlockingError::Join(e.to_string()))?
        .map_err(BlockingError::Canonicalization)
    }
}

enum BlockingError {
    Canonicalization(CanonicalizationError),
    Join(String),
}

/// 先存证据字节再写账本；证据没存下来就不写账本 (账本里不能出现悬空指针)
fn persist(recorder: &EvidenceRecorder, mut result: DetectionResult, canonical: &CanonicalContent) -> DetectionReport {
    let pointer = match recorder.store_evidence(canonical.kind, &canonical.bytes) {
        Ok(pointer) => pointer,
        Err(err) => {
            warn!(url = %result.url, result_id = %result.id, stage = ?CaptureStage::Blob, error = %err, "⚠️ 证据字节写入失败，判定照常返回");
            return DetectionReport {
                result,
                evidence_capture: EvidenceCapture::Failed {
                    stage: CaptureStage::Blob,
                    error: err.to_string(),
                },
            };
        }
    };
    result.evidence = Some(pointer);

    let evidence_capture = match recorder.record(&result) {
        Ok(receipt) => EvidenceCapture::Recorded { receipt },
        Err(err) => {
            warn!(url = %result.url, result_id = %result.id, stage = ?CaptureStage::Ledger, error = %err, "⚠️ 账本写入失败，判定照常返回");
            EvidenceCapture::Failed {
                stage: CaptureStage::Ledger,
                error: err.to_string(),
            }
        }
    };
    DetectionReport {
        result,
        evidence_capture,
    }
}
