//! 页面抓取 (Fetcher)
//!
//! `PageSource` 是和外部世界的接缝：直接 HTTP (`HttpSource`) 或者交给渲染服务
//! (`RenderServiceSource`，等网络静默后再取 DOM)。`Fetcher` 在其上统一处理
//! robots.txt、重试退避、硬超时和取消。

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::canonical::ContentKind;
use crate::config::FetchConfig;
use crate::error::FetchError;

/// 抓取结果 (原始字节 + 分类)
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub requested_url: Url,
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub kind: ContentKind,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// 第几次尝试成功
    pub attempts: u32,
    /// 是否经过渲染服务 (执行过页面脚本)
    pub rendered: bool,
}

impl FetchedContent {
    pub fn new(url: Url, content_type: Option<String>, body: Vec<u8>) -> Self {
        let kind = ContentKind::classify(content_type.as_deref(), &body);
        Self {
            final_url: url.clone(),
            requested_url: url,
            status: 200,
            content_type,
            kind,
            body,
            fetched_at: Utc::now(),
            attempts: 1,
            rendered: false,
        }
    }
}

/// 动态页面的稳定条件：静默期内没有新的网络请求，整体不超过 timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub quiet_period: Duration,
    pub timeout: Duration,
}

pub trait PageSource: Send + Sync + 'static {
    fn load(
        &self,
        url: &Url,
        settle: &SettlePolicy,
    ) -> impl Future<Output = Result<FetchedContent, FetchError>> + Send;

    /// 该站点的 robots.txt；取不到视为没有限制
    fn robots_txt(&self, _url: &Url) -> impl Future<Output = Result<Option<String>, FetchError>> + Send {
        async { Ok(None) }
    }
}

// ==========================================
// 1. 直接 HTTP
// ==========================================

pub struct HttpSource {
    client: Client,
    max_body_bytes: usize,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

impl PageSource for HttpSource {
    async fn load(&self, url: &Url, _settle: &SettlePolicy) -> Result<FetchedContent, FetchError> {
        let started = Instant::now();
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_reqwest(url, e, started))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());
        if response.content_length().is_some_and(|len| len as usize > self.max_body_bytes) {
            return Err(too_large(url, self.max_body_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| map_reqwest(url, e, started))? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large(url, self.max_body_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        let kind = ContentKind::classify(content_type.as_deref(), &body);
        Ok(FetchedContent {
            requested_url: url.clone(),
            final_url,
            status: status.as_u16(),
            content_type,
            kind,
            body,
            fetched_at: Utc::now(),
            attempts: 1,
            rendered: false,
        })
    }

    async fn robots_txt(&self, url: &Url) -> Result<Option<String>, FetchError> {
        Ok(fetch_robots(&self.client, url).await)
    }
}

// ==========================================
// 2. 渲染服务 (无头浏览器在服务端)
// ==========================================

#[derive(Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    wait_until: &'static str,
    quiet_period_ms: u64,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct RenderResponse {
    status: u16,
    #[serde(default)]
    final_url: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    content: String,
    #[serde(default)]
    settled: bool,
}

pub struct RenderServiceSource {
    client: Client,
    endpoint: Url,
    max_body_bytes: usize,
}

impl RenderServiceSource {
    pub fn new(endpoint: Url, config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

impl PageSource for RenderServiceSource {
    async fn load(&self, url: &Url, settle: &SettlePolicy) -> Result<FetchedContent, FetchError> {
        let started = Instant::now();
        let request = RenderRequest {
            url: url.as_str(),
            wait_until: "networkidle",
            quiet_period_ms: settle.quiet_period.as_millis() as u64,
            timeout_ms: settle.timeout.as_millis() as u64,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest(url, e, started))?;

        if !response.status().is_success() {
            return Err(FetchError::Render {
                url: url.to_string(),
                message: format!("render service answered {}", response.status()),
            });
        }
        let rendered: RenderResponse = response.json().await.map_err(|e| FetchError::Render {
            url: url.to_string(),
            message: format!("invalid render response: {e}"),
        })?;

        if !(200..300).contains(&rendered.status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: rendered.status,
            });
        }
        if rendered.content.len() > self.max_body_bytes {
            return Err(too_large(url, self.max_body_bytes));
        }
        if !rendered.settled {
            warn!(url = %url, "页面在超时前未达到网络静默，使用当前 DOM");
        }

        let final_url = rendered
            .final_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .unwrap_or_else(|| url.clone());
        let content_type = rendered.content_type.or_else(|| Some("text/html".to_string()));
        let body = rendered.content.into_bytes();
        let kind = ContentKind::classify(content_type.as_deref(), &body);
        Ok(FetchedContent {
            requested_url: url.clone(),
            final_url,
            status: rendered.status,
            content_type,
            kind,
            body,
            fetched_at: Utc::now(),
            attempts: 1,
            rendered: true,
        })
    }

    async fn robots_txt(&self, url: &Url) -> Result<Option<String>, FetchError> {
        Ok(fetch_robots(&self.client, url).await)
    }
}

/// 启动时二选一
pub enum PageLoader {
    Direct(HttpSource),
    Rendered(RenderServiceSource),
}

impl PageLoader {
    pub fn from_config(render_endpoint: Option<&str>, config: &FetchConfig) -> anyhow::Result<Self> {
        Ok(match render_endpoint {
            Some(endpoint) => Self::Rendered(RenderServiceSource::new(Url::parse(endpoint)?, config)?),
            None => Self::Direct(HttpSource::new(config)?),
        })
    }
}

impl PageSource for PageLoader {
    async fn load(&self, url: &Url, settle: &SettlePolicy) -> Result<FetchedContent, FetchError> {
        match self {
            Self::Direct(source) => source.load(url, settle).await,
            Self::Rendered(source) => source.load(url, settle).await,
        }
    }

    async fn robots_txt(&self, url: &Url) -> Result<Option<String>, FetchError> {
        match self {
            Self::Direct(source) => source.robots_txt(url).await,
            Self::Rendered(source) => source.robots_txt(url).await,
        }
    }
}

// ==========================================
// 3. robots.txt
// ==========================================

/// 只实现前缀规则：最长匹配优先，长度相同时 Allow 优先
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotsRules {
    rules: Vec<(bool, String)>,
}

impl RobotsRules {
    pub fn parse(text: &str, user_agent: &str) -> Self {
        let agent = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .trim()
            .to_ascii_lowercase();

        let mut specific = Vec::new();
        let mut wildcard = Vec::new();
        let mut group_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();
            match field.as_str() {
                "user-agent" => {
                    if in_rules {
                        group_agents.clear();
                        in_rules = false;
                    }
                    if !value.is_empty() {
                        group_agents.push(value.to_ascii_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    if value.is_empty() {
                        continue;
                    }
                    let rule = (field == "allow", value.trim_end_matches('*').to_string());
                    for group_agent in &group_agents {
                        if group_agent == "*" {
                            wildcard.push(rule.clone());
                        } else if !agent.is_empty() && agent.contains(group_agent.as_str()) {
                            specific.push(rule.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        Self {
            rules: if specific.is_empty() { wildcard } else { specific },
        }
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        self.rules
            .iter()
            .filter(|(_, prefix)| path.starts_with(prefix.as_str()))
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| a.0.cmp(&b.0)))
            .map_or(true, |(allow, _)| *allow)
    }
}

/// robots.txt 最多读这么多字节，超出部分丢弃
const ROBOTS_MAX_BYTES: usize = 512 * 1024;

async fn fetch_robots(client: &Client, url: &Url) -> Option<String> {
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    let mut resp = match client.get(robots).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(_) => return None,
        Err(err) => {
            debug!(url = %url, error = %err, "robots.txt 不可达，按允许处理");
            return None;
        }
    };

    let mut body = Vec::new();
    while let Ok(Some(chunk)) = resp.chunk().await {
        if append_capped(&mut body, &chunk, ROBOTS_MAX_BYTES) {
            debug!(url = %url, limit = ROBOTS_MAX_BYTES, "robots.txt 过大，截断");
            break;
        }
    }
    Some(String::from_utf8_lossy(&body).into_owned())
}

/// 追加到 `limit` 为止；返回 true 表示已经读满
fn append_capped(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(body.len());
    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    body.len() >= limit
}

/// 按站点缓存的 robots 规则：条目过期后重新拉取，满了先清过期的再挤掉最旧的
struct RobotsCache {
    entries: HashMap<String, (Instant, Arc<RobotsRules>)>,
    capacity: usize,
    ttl: Duration,
}

impl RobotsCache {
    const CAPACITY: usize = 1024;
    const TTL: Duration = Duration::from_secs(60 * 60);

    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn get(&self, origin: &str, now: Instant) -> Option<Arc<RobotsRules>> {
        self.entries
            .get(origin)
            .filter(|(stored, _)| now.saturating_duration_since(*stored) < self.ttl)
            .map(|(_, rules)| Arc::clone(rules))
    }

    fn insert(&mut self, origin: String, rules: Arc<RobotsRules>, now: Instant) {
        if !self.entries.contains_key(&origin) && self.entries.len() >= self.capacity {
            let ttl = self.ttl;
            self.entries
                .retain(|_, (stored, _)| now.saturating_duration_since(*stored) < ttl);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, (stored, _))| *stored)
                    .map(|(key, _)| key.clone());
                if let Some(key) = oldest {
                    self.entries.remove(&key);
                }
            }
        }
        self.entries.insert(origin, (now, rules));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ==========================================
// 4. Fetcher：robots + 重试 + 超时 + 取消
// ==========================================

pub struct Fetcher<S> {
    source: S,
    config: FetchConfig,
    robots_cache: Mutex<RobotsCache>,
}

impl<S: PageSource> Fetcher<S> {
    pub fn new(source: S, config: FetchConfig) -> Self {
        Self {
            source,
            config,
            robots_cache: Mutex::new(RobotsCache::new(RobotsCache::CAPACITY, RobotsCache::TTL)),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// 抓取 URL。
    ///
    /// 硬超时覆盖 robots、所有尝试和退避等待；`cancel` 触发时立即丢弃进行中的请求
    /// (连接 / 渲染会话随 future 一起释放) 并返回 `Cancelled`。
    pub async fn fetch(&self, raw_url: &str, cancel: &CancellationToken) -> Result<FetchedContent, FetchError> {
        let url = parse_target(raw_url)?;
        let started = Instant::now();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(url = %url, "⛔ 抓取被取消");
                Err(FetchError::Cancelled { url: url.to_string() })
            }
            outcome = tokio::time::timeout(self.config.timeout, self.fetch_with_retries(&url)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        url: url.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// 第 `attempt` 次失败后的等待：base * 2^(attempt-1)，不超过 cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_cap)
    }

    async fn fetch_with_retries(&self, url: &Url) -> Result<FetchedContent, FetchError> {
        if self.config.respect_robots {
            self.check_robots(url).await?;
        }

        let settle = SettlePolicy {
            quiet_period: self.config.quiet_period,
            timeout: self.config.timeout,
        };
        let mut attempt = 1u32;
        loop {
            match self.source.load(url, &settle).await {
                Ok(mut content) => {
                    content.attempts = attempt;
                    info!(url = %url, attempt, bytes = content.body.len(), kind = ?content.kind, "🌐 抓取完成");
                    return Ok(content);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(url = %url, attempt, error = %err, delay_ms = delay.as_millis() as u64, "抓取失败，准备重试");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn check_robots(&self, url: &Url) -> Result<(), FetchError> {
        let origin = url.origin().ascii_serialization();
        let cached = self
            .robots_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&origin, Instant::now());

        let rules = match cached {
            Some(rules) => rules,
            None => {
                let text = self.source.robots_txt(url).await?;
                let rules = Arc::new(
                    text.map(|t| RobotsRules::parse(&t, &self.config.user_agent))
                        .unwrap_or_default(),
                );
                self.robots_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(origin, Arc::clone(&rules), Instant::now());
                rules
            }
        };

        if rules.is_allowed(url.path()) {
            Ok(())
        } else {
            Err(FetchError::Blocked {
                url: url.to_string(),
                reason: "disallowed by robots.txt".to_string(),
            })
        }
    }
}

fn parse_target(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn map_reqwest(url: &Url, err: reqwest::Error, started: Instant) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else if let Some(status) = err.status() {
        FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        // 连接失败、DNS、连接中途断开都归为可重试的网络错误
        FetchError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

fn too_large(url: &Url, limit: usize) -> FetchError {
    FetchError::Body {
        url: url.to_string(),
        message: format!("body exceeds {limit} bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<FetchedContent, FetchError>>>,
        calls: AtomicU32,
        delay: Duration,
        robots: Option<String>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<FetchedContent, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
                robots: None,
            }
        }
    }

    impl PageSource for ScriptedSource {
        async fn load(&self, _url: &Url, _settle: &SettlePolicy) -> Result<FetchedContent, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(FetchError::Connect { url: "x".into(), message: "script exhausted".into() }))
        }

        async fn robots_txt(&self, _url: &Url) -> Result<Option<String>, FetchError> {
            Ok(self.robots.clone())
        }
    }

    fn page() -> FetchedContent {
        FetchedContent::new(
            Url::parse("https://example.com/a").unwrap(),
            Some("text/html".into()),
            b"<p>hello</p>".to_vec(),
        )
    }

    fn connect() -> FetchError {
        FetchError::Connect { url: "https://example.com/a".into(), message: "refused".into() }
    }

    fn fast_config() -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = ScriptedSource::new(vec![
            Err(connect()),
            Err(FetchError::Status { url: "u".into(), status: 503 }),
            Ok(page()),
        ]);
        let fetcher = Fetcher::new(source, fast_config());
        let content = fetcher.fetch("https://example.com/a", &CancellationToken::new()).await.unwrap();
        assert_eq!(content.attempts, 3);
        assert_eq!(content.kind, ContentKind::Html);
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source = ScriptedSource::new(vec![Err(connect()), Err(connect()), Err(connect()), Ok(page())]);
        let fetcher = Fetcher::new(source, fast_config());
        let err = fetcher.fetch("https://example.com/a", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Connect { .. }));
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_fail_immediately() {
        let source = ScriptedSource::new(vec![Err(FetchError::Status { url: "u".into(), status: 404 }), Ok(page())]);
        let fetcher = Fetcher::new(source, fast_config());
        let err = fetcher.fetch("https://example.com/a", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 1);

        let err = fetcher.fetch("ftp://example.com/file", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        let err = fetcher.fetch("not a url", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn hard_timeout_covers_slow_sources() {
        let mut source = ScriptedSource::new(vec![Ok(page())]);
        source.delay = Duration::from_millis(500);
        let config = FetchConfig { timeout: Duration::from_millis(50), ..fast_config() };
        let fetcher = Fetcher::new(source, config);
        let err = fetcher.fetch("https://example.com/a", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let mut source = ScriptedSource::new(vec![Ok(page())]);
        source.delay = Duration::from_secs(30);
        let config = FetchConfig { timeout: Duration::from_secs(60), ..fast_config() };
        let fetcher = Fetcher::new(source, config);

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher.fetch("https://example.com/a", &token).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn robots_disallow_blocks_without_loading() {
        let mut source = ScriptedSource::new(vec![Ok(page())]);
        source.robots = Some("User-agent: *\nDisallow: /private\n".to_string());
        let fetcher = Fetcher::new(source, fast_config());

        let err = fetcher.fetch("https://example.com/private/x", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::Blocked { .. }));
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 0);

        assert!(fetcher.fetch("https://example.com/a", &CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn robots_cache_stays_bounded_across_many_sites() {
        let pages = (0..RobotsCache::CAPACITY + 10).map(|_| Ok(page())).collect();
        let fetcher = Fetcher::new(ScriptedSource::new(pages), fast_config());
        for i in 0..RobotsCache::CAPACITY + 10 {
            let url = format!("https://site{i}.example.com/a");
            fetcher.fetch(&url, &CancellationToken::new()).await.unwrap();
        }
        assert_eq!(fetcher.robots_cache.lock().unwrap().len(), RobotsCache::CAPACITY);
    }

    #[test]
    fn robots_cache_expires_and_evicts_oldest() {
        let mut cache = RobotsCache::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        let rules = Arc::new(RobotsRules::default());

        cache.insert("https://a".into(), Arc::clone(&rules), t0);
        cache.insert("https://b".into(), Arc::clone(&rules), t0 + Duration::from_secs(1));
        assert!(cache.get("https://a", t0 + Duration::from_secs(59)).is_some());
        assert!(cache.get("https://a", t0 + Duration::from_secs(60)).is_none());

        cache.insert("https://c".into(), Arc::clone(&rules), t0 + Duration::from_secs(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("https://a", t0 + Duration::from_secs(3)).is_none());
        assert!(cache.get("https://b", t0 + Duration::from_secs(3)).is_some());
        assert!(cache.get("https://c", t0 + Duration::from_secs(3)).is_some());
    }

    #[test]
    fn robots_body_is_truncated_at_the_limit() {
        let mut body = Vec::new();
        assert!(!append_capped(&mut body, b"User-agent: *\n", 32));
        assert!(append_capped(&mut body, &[b'#'; 100], 32));
        assert_eq!(body.len(), 32);
        assert!(append_capped(&mut body, b"Disallow: /", 32));
        assert_eq!(body.len(), 32);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = FetchConfig {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(3),
            ..FetchConfig::default()
        };
        let fetcher = Fetcher::new(ScriptedSource::new(vec![]), config);
        assert_eq!(fetcher.backoff(1), Duration::from_millis(500));
        assert_eq!(fetcher.backoff(2), Duration::from_millis(1000));
        assert_eq!(fetcher.backoff(3), Duration::from_millis(2000));
        assert_eq!(fetcher.backoff(4), Duration::from_secs(3));
        assert_eq!(fetcher.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn robots_rules_pick_the_most_specific_group() {
        let text = "\
# comment
User-agent: *
Disallow: /

User-agent: kai-shield
Disallow: /drafts
Allow: /drafts/public
";
        let rules = RobotsRules::parse(text, "kai-shield/0.1.0");
        assert!(rules.is_allowed("/articles/1"));
        assert!(!rules.is_allowed("/drafts/secret"));
        assert!(rules.is_allowed("/drafts/public/page"));

        let other = RobotsRules::parse(text, "otherbot/1.0");
        assert!(!other.is_allowed("/articles/1"));

        let empty = RobotsRules::parse("User-agent: *\nDisallow:\n", "kai-shield");
        assert!(empty.is_allowed("/anything"));
    }
}
