use anyhow::{bail, Context};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 判定策略：阈值 + 最大近似距离
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    /// 相似度阈值，score 必须严格大于它才判定侵权
    pub threshold: f64,
    /// 近似签名允许的最大汉明距离 (同时决定索引的分带数)
    pub max_distance: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            max_distance: 8,
        }
    }
}

/// 抓取参数
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// 硬超时：覆盖连接、渲染静默等待、读取正文以及所有重试
    pub timeout: Duration,
    /// 总尝试次数 (含第一次)
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// 网络静默期：渲染服务在这段时间内没有新请求才认为页面稳定
    pub quiet_period: Duration,
    pub max_body_bytes: usize,
    pub respect_robots: bool,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            quiet_period: Duration::from_millis(500),
            max_body_bytes: 10 * 1024 * 1024,
            respect_robots: true,
            user_agent: format!("kai-shield/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// 指纹参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintConfig {
    /// 每个 shingle 包含的 token 数
    pub shingle_size: usize,
    /// 分块签名的窗口长度 (token)，步长为一半
    pub chunk_tokens: usize,
    /// 图片宽×高上限，超过的在解码前拒绝
    pub max_image_pixels: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            shingle_size: 4,
            chunk_tokens: 256,
            max_image_pixels: crate::canonical::DEFAULT_MAX_IMAGE_PIXELS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub key_path: String,
    /// 渲染服务地址；未设置时直接 HTTP 抓取
    pub render_endpoint: Option<String>,
    pub policy: DecisionPolicy,
    pub fetch: FetchConfig,
    pub fingerprint: FingerprintConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let fetch_defaults = FetchConfig::default();
        let policy_defaults = DecisionPolicy::default();
        let fp_defaults = FingerprintConfig::default();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("PORT", 3000)?,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "data/db/shield_db".to_string()),
            key_path: env::var("KEY_PATH").unwrap_or_else(|_| "shield.key".to_string()),
            render_endpoint: env::var("RENDER_ENDPOINT").ok().filter(|v| !v.trim().is_empty()),
            policy: DecisionPolicy {
                threshold: parse_env("SIMILARITY_THRESHOLD", policy_defaults.threshold)?,
                max_distance: parse_env("MAX_DISTANCE", policy_defaults.max_distance)?,
            },
            fetch: FetchConfig {
                timeout: millis_env("FETCH_TIMEOUT_MS", fetch_defaults.timeout)?,
                max_attempts: parse_env("FETCH_MAX_ATTEMPTS", fetch_defaults.max_attempts)?,
                backoff_base: millis_env("FETCH_BACKOFF_MS", fetch_defaults.backoff_base)?,
                backoff_cap: millis_env("FETCH_BACKOFF_CAP_MS", fetch_defaults.backoff_cap)?,
                quiet_period: millis_env("FETCH_QUIET_MS", fetch_defaults.quiet_period)?,
                max_body_bytes: parse_env("FETCH_MAX_BODY_BYTES", fetch_defaults.max_body_bytes)?,
                respect_robots: parse_env("RESPECT_ROBOTS", fetch_defaults.respect_robots)?,
                user_agent: env::var("USER_AGENT").unwrap_or(fetch_defaults.user_agent),
            },
            fingerprint: FingerprintConfig {
                shingle_size: parse_env("SHINGLE_SIZE", fp_defaults.shingle_size)?,
                chunk_tokens: parse_env("CHUNK_TOKENS", fp_defaults.chunk_tokens)?,
                max_image_pixels: parse_env("MAX_IMAGE_PIXELS", fp_defaults.max_image_pixels)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.policy.threshold) {
            bail!("SIMILARITY_THRESHOLD must be within [0, 1], got {}", self.policy.threshold);
        }
        if self.policy.max_distance >= crate::fingerprint::SIGNATURE_BITS {
            bail!(
                "MAX_DISTANCE must be below {}, got {}",
                crate::fingerprint::SIGNATURE_BITS,
                self.policy.max_distance
            );
        }
        if self.fetch.max_attempts == 0 {
            bail!("FETCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.fingerprint.shingle_size == 0 || self.fingerprint.chunk_tokens < 2 {
            bail!("SHINGLE_SIZE must be >= 1 and CHUNK_TOKENS >= 2");
        }
        if self.fingerprint.max_image_pixels == 0 {
            bail!("MAX_IMAGE_PIXELS must be at least 1");
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn millis_env(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let millis: u64 = parse_env(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
