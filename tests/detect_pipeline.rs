use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use kai_shield_core::blob_store::{BlobStore, MemoryBlobStore};
use kai_shield_core::evidence::{CaptureStage, ContentAddress, EvidenceCapture};
use kai_shield_core::fetcher::{FetchedContent, Fetcher, PageSource, SettlePolicy};
use kai_shield_core::fingerprint::Fingerprinter;
use kai_shield_core::signer::EvidenceSigner;
use kai_shield_core::{
    ContentSource, CorpusIndex, DecisionEngine, DecisionPolicy, DetectOptions, Detector, EvidenceRecorder, FetchConfig,
    FetchError, FingerprintConfig, MatchKind, PersistenceError, WorkId,
};
use url::Url;

// ==========================================
// 测试桩：内存里的“互联网”
// ==========================================

#[derive(Default)]
struct FakeWeb {
    pages: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl FakeWeb {
    fn serve(&self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.pages
            .write()
            .unwrap()
            .insert(url.to_string(), (content_type.to_string(), body.into()));
    }
}

impl PageSource for FakeWeb {
    async fn load(&self, url: &Url, _settle: &SettlePolicy) -> Result<FetchedContent, FetchError> {
        let page = self.pages.read().unwrap().get(url.as_str()).cloned();
        match page {
            Some((content_type, body)) => Ok(FetchedContent::new(url.clone(), Some(content_type), body)),
            None => Err(FetchError::Connect {
                url: url.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

struct FailingBlobStore;

impl BlobStore for FailingBlobStore {
    fn put(&self, _bytes: &[u8]) -> Result<ContentAddress, PersistenceError> {
        Err(PersistenceError::Blob("blob store unavailable".to_string()))
    }

    fn get(&self, _address: &ContentAddress) -> Result<Option<Vec<u8>>, PersistenceError> {
        Err(PersistenceError::Blob("blob store unavailable".to_string()))
    }
}

/// 写入前先睡一会儿，模拟慢盘
struct SlowBlobStore {
    inner: MemoryBlobStore,
    delay: Duration,
}

impl BlobStore for SlowBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentAddress, PersistenceError> {
        std::thread::sleep(self.delay);
        self.inner.put(bytes)
    }

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.inner.get(address)
    }
}

fn detector_with(web: FakeWeb, blobs: Arc<dyn BlobStore>) -> Arc<Detector<FakeWeb>> {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let policy = DecisionPolicy::default();
    let fetch = FetchConfig {
        timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(4),
        ..FetchConfig::default()
    };
    let recorder = EvidenceRecorder::open(&db, blobs, Arc::new(EvidenceSigner::new())).unwrap();
    Arc::new(Detector::new(
        Fetcher::new(web, fetch),
        Fingerprinter::new(FingerprintConfig::default()),
        Arc::new(CorpusIndex::in_memory(policy.max_distance)),
        DecisionEngine::new(policy),
        Arc::new(recorder),
    ))
}

fn detector(web: FakeWeb) -> Arc<Detector<FakeWeb>> {
    detector_with(web, Arc::new(MemoryBlobStore::new()))
}

/// 确定性的“文章”：同一个 seed 永远得到同一段文字
fn article(seed: u64, words: usize) -> Vec<String> {
    const SYLLABLES: &[&str] = &[
        "ka", "lo", "mi", "ren", "tu", "sa", "vo", "ne", "qui", "da", "pe", "ro", "li", "fa", "zen", "mo",
    ];
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..words)
        .map(|_| {
            let mut word = String::new();
            for _ in 0..3 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                word.push_str(SYLLABLES[(state >> 60) as usize]);
            }
            word
        })
        .collect()
}

fn as_html(words: &[String]) -> String {
    let paragraphs: Vec<String> = words.chunks(40).map(|c| format!("<p>{}</p>", c.join(" "))).collect();
    format!(
        "<!doctype html><html><head><title>post</title></head><body><article>{}</article></body></html>",
        paragraphs.join("\n")
    )
}

fn inline_text(words: &[String]) -> ContentSource {
    ContentSource::Inline {
        bytes: words.join(" ").into_bytes(),
        content_type: Some("text/plain; charset=utf-8".to_string()),
    }
}

fn far_future() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}

// ==========================================
// 场景
// ==========================================

#[tokio::test]
async fn exact_copy_is_infringing_and_recorded() {
    let original = article(1, 300);
    let web = FakeWeb::default();
    web.serve("https://copycat.example/post", "text/html; charset=utf-8", as_html(&original));
    let detector = detector(web);

    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    let report = detector
        .detect("https://copycat.example/post", DetectOptions::default())
        .await
        .unwrap();
    let decision = &report.result.decision;
    assert!(decision.verdict);
    assert_eq!(decision.score, 1.0);
    assert_eq!(decision.match_kind, MatchKind::Exact);
    assert_eq!(decision.work.as_ref().unwrap().work_id, WorkId::from("A"));

    assert!(report.evidence_capture.is_recorded());
    let check = detector.recorder().verify_evidence(&report.result.id).unwrap().unwrap();
    assert!(check.valid);
    assert_eq!(detector.recorder().results_for_work("A").unwrap().len(), 1);
}

#[tokio::test]
async fn cosmetic_edits_still_match() {
    let original = article(2, 300);
    let restyled = format!(
        "<html><body class=\"x-{}\"><div><div>   <script>var t = {};</script>\n{}\n</div></div></body></html>",
        "a8f3", 1_700_000_000, original.join("  <br/>\n ")
    );
    let web = FakeWeb::default();
    web.serve("https://mirror.example/copy", "text/html", restyled);
    let detector = detector(web);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    let report = detector
        .detect("https://mirror.example/copy", DetectOptions::default())
        .await
        .unwrap();
    assert!(report.result.decision.verdict);
    assert_eq!(report.result.decision.score, 1.0);
}

#[tokio::test]
async fn partial_edit_matches_through_unchanged_chunks() {
    let original = article(3, 600);
    let mut edited = original.clone();
    edited[5] = "completely".to_string();
    edited[17] = "different".to_string();

    let web = FakeWeb::default();
    web.serve("https://blog.example/edited", "text/html", as_html(&edited));
    let detector = detector(web);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    let report = detector
        .detect("https://blog.example/edited", DetectOptions::default())
        .await
        .unwrap();
    let decision = &report.result.decision;
    assert_eq!(decision.match_kind, MatchKind::Approximate);
    assert!(decision.verdict);
    assert!(decision.score > decision.threshold);
    assert_eq!(decision.work.as_ref().unwrap().work_id, WorkId::from("A"));
}

#[tokio::test]
async fn one_word_edit_in_a_short_article_still_matches() {
    let original = article(13, 60);
    for position in [0, 29, 59] {
        let mut edited = original.clone();
        edited[position] = "completely".to_string();

        let web = FakeWeb::default();
        web.serve("https://blog.example/short", "text/html", as_html(&edited));
        let detector = detector(web);
        detector
            .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
            .await
            .unwrap();

        let report = detector
            .detect("https://blog.example/short", DetectOptions::default())
            .await
            .unwrap();
        let decision = &report.result.decision;
        assert!(decision.verdict, "edit at {position}: score {}", decision.score);
        assert_eq!(decision.match_kind, MatchKind::Approximate);
        assert_eq!(decision.work.as_ref().unwrap().work_id, WorkId::from("A"));
    }
}

#[tokio::test]
async fn latin1_labelled_page_is_decoded_and_matched() {
    let original = article(14, 300);
    let web = FakeWeb::default();
    web.serve("https://legacy.example/post", "text/html; charset=ISO-8859-1", as_html(&original));
    let detector = detector(web);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    let report = detector
        .detect("https://legacy.example/post", DetectOptions::default())
        .await
        .unwrap();
    assert!(report.result.decision.verdict);
    assert_eq!(report.result.decision.match_kind, MatchKind::Exact);
}

#[tokio::test]
async fn unrelated_page_is_not_a_match() {
    let web = FakeWeb::default();
    web.serve("https://news.example/other", "text/html", as_html(&article(99, 300)));
    let detector = detector(web);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&article(4, 300))])
        .await
        .unwrap();

    let report = detector
        .detect("https://news.example/other", DetectOptions::default())
        .await
        .unwrap();
    assert!(!report.result.decision.verdict);
    assert_eq!(report.result.decision.match_kind, MatchKind::None);
    assert_eq!(report.result.decision.score, 0.0);
    // “未侵权”同样是一条可审计的结论
    assert!(report.evidence_capture.is_recorded());
}

#[tokio::test]
async fn unreachable_url_is_undetermined_and_nothing_is_persisted() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let detector = detector_with(FakeWeb::default(), blobs.clone());

    let err = detector
        .detect("https://unreachable.example/x", DetectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "connect_failure");
    assert!(blobs.is_empty());
    assert!(detector
        .recorder()
        .results_between(chrono::DateTime::<Utc>::default(), far_future())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn blob_failure_keeps_the_verdict() {
    let original = article(5, 300);
    let web = FakeWeb::default();
    web.serve("https://copycat.example/post", "text/html", as_html(&original));
    let detector = detector_with(web, Arc::new(FailingBlobStore));
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    let report = detector
        .detect("https://copycat.example/post", DetectOptions::default())
        .await
        .unwrap();
    assert!(report.result.decision.verdict);
    assert!(report.result.evidence.is_none());
    assert!(matches!(
        report.evidence_capture,
        EvidenceCapture::Failed { stage: CaptureStage::Blob, .. }
    ));
    assert!(detector.recorder().result(&report.result.id).unwrap().is_none());
}

#[tokio::test]
async fn persistence_finishes_after_caller_goes_away() {
    let original = article(15, 300);
    let web = FakeWeb::default();
    web.serve("https://copycat.example/post", "text/html", as_html(&original));
    let blobs = Arc::new(SlowBlobStore {
        inner: MemoryBlobStore::new(),
        delay: Duration::from_millis(300),
    });
    let detector = detector_with(web, blobs);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();

    // 调用方在存证写完之前就放弃了
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        detector.detect("https://copycat.example/post", DetectOptions::default()),
    )
    .await;
    assert!(outcome.is_err());

    let deadline = Instant::now() + Duration::from_secs(3);
    let recorded = loop {
        let recorded = detector
            .recorder()
            .results_between(chrono::DateTime::<Utc>::default(), far_future())
            .unwrap();
        if !recorded.is_empty() || Instant::now() > deadline {
            break recorded;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].result.decision.verdict);
}

#[tokio::test]
async fn detection_is_idempotent() {
    let web = FakeWeb::default();
    web.serve("https://site.example/a", "text/html", as_html(&article(6, 400)));
    let detector = detector(web);

    let first = detector.detect("https://site.example/a", DetectOptions::default()).await.unwrap();
    let second = detector.detect("https://site.example/a", DetectOptions::default()).await.unwrap();
    assert_eq!(first.result.fingerprint, second.result.fingerprint);
    assert_eq!(first.result.decision, second.result.decision);
    assert_ne!(first.result.id, second.result.id);
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let text = article(7, 200);
    let detector = detector(FakeWeb::default());
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&text)])
        .await
        .unwrap();

    let err = detector
        .register_work(WorkId::from("B"), "bob", vec![inline_text(&text)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "duplicate_registration");
    assert_eq!(detector.corpus().len(), 1);
}

#[tokio::test]
async fn revoked_work_no_longer_matches() {
    let original = article(8, 300);
    let web = FakeWeb::default();
    web.serve("https://copycat.example/post", "text/html", as_html(&original));
    let detector = detector(web);
    detector
        .register_work(WorkId::from("A"), "alice", vec![inline_text(&original)])
        .await
        .unwrap();
    detector.revoke_work(&WorkId::from("A")).unwrap();

    let report = detector
        .detect("https://copycat.example/post", DetectOptions::default())
        .await
        .unwrap();
    assert!(!report.result.decision.verdict);
}

#[tokio::test]
async fn image_copy_in_another_format_matches() {
    let mut picture = RgbImage::new(48, 32);
    for (x, y, pixel) in picture.enumerate_pixels_mut() {
        *pixel = Rgb([(x * 5) as u8, (y * 7) as u8, ((x + y) * 3) as u8]);
    }
    let encode = |format: ImageOutputFormat| {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(picture.clone()).write_to(&mut out, format).unwrap();
        out
    };

    let web = FakeWeb::default();
    web.serve("https://img.example/photo.bmp", "image/bmp", encode(ImageOutputFormat::Bmp));
    let detector = detector(web);
    detector
        .register_work(
            WorkId::from("photo"),
            "carol",
            vec![ContentSource::Inline {
                bytes: encode(ImageOutputFormat::Png),
                content_type: Some("image/png".to_string()),
            }],
        )
        .await
        .unwrap();

    let report = detector
        .detect("https://img.example/photo.bmp", DetectOptions::default())
        .await
        .unwrap();
    assert!(report.result.decision.verdict);
    assert_eq!(report.result.decision.match_kind, MatchKind::Exact);
}

#[tokio::test]
async fn concurrent_registration_and_detection() {
    let web = FakeWeb::default();
    for n in 0..8u64 {
        web.serve(&format!("https://copy.example/{n}"), "text/html", as_html(&article(100 + n, 300)));
    }
    let detector = detector(web);

    let mut registrations = Vec::new();
    for n in 0..8u64 {
        let detector = Arc::clone(&detector);
        registrations.push(tokio::spawn(async move {
            detector
                .register_work(WorkId(format!("work-{n}")), "owner", vec![inline_text(&article(100 + n, 300))])
                .await
        }));
    }
    for handle in registrations {
        handle.await.unwrap().unwrap();
    }

    let mut detections = Vec::new();
    for n in 0..8u64 {
        let detector = Arc::clone(&detector);
        detections.push(tokio::spawn(async move {
            let report = detector
                .detect(&format!("https://copy.example/{n}"), DetectOptions::default())
                .await
                .unwrap();
            (n, report)
        }));
    }
    for handle in detections {
        let (n, report) = handle.await.unwrap();
        assert!(report.result.decision.verdict);
        assert_eq!(
            report.result.decision.work.as_ref().unwrap().work_id,
            WorkId(format!("work-{n}"))
        );
    }

    let recorded = detector
        .recorder()
        .results_between(chrono::DateTime::<Utc>::default(), far_future())
        .unwrap();
    assert_eq!(recorded.len(), 8);
}
