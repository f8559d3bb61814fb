use anyhow::Context;
use kai_shield_core::blob_store::SledBlobStore;
use kai_shield_core::fetcher::{Fetcher, PageLoader};
use kai_shield_core::fingerprint::Fingerprinter;
use kai_shield_core::signer::EvidenceSigner;
use kai_shield_core::{api, Config, CorpusIndex, DecisionEngine, Detector, EvidenceRecorder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env().context("配置无效")?;
    info!(
        "⚙️  配置加载完成: Host={}:{}, DB={}, Key={}, threshold={}, max_distance={}",
        config.host, config.port, config.db_path, config.key_path, config.policy.threshold, config.policy.max_distance
    );

    // ----------------------------------------------------------------
    // 1. 系统初始化 & 身份加载
    // ----------------------------------------------------------------
    info!("🛡️ [Kai Shield] 侵权检测服务启动中...");

    let signer = EvidenceSigner::load_or_generate(&config.key_path)?;
    info!("🆔 服务身份ID (Public Key): {}", hex::encode(signer.public_key().to_bytes()));

    let db = sled::open(&config.db_path).with_context(|| format!("打开数据库失败: {}", config.db_path))?;
    let corpus = Arc::new(CorpusIndex::open(&db, config.policy.max_distance)?);
    let blobs = Arc::new(SledBlobStore::open(&db)?);
    let recorder = Arc::new(EvidenceRecorder::open(&db, blobs, Arc::new(signer))?);
    info!("📚 作品库 ({} 件) 与证据库初始化完成", corpus.len());

    let loader = PageLoader::from_config(config.render_endpoint.as_deref(), &config.fetch)?;
    match &config.render_endpoint {
        Some(endpoint) => info!("🖥️  动态页面经渲染服务抓取: {}", endpoint),
        None => info!("🌐 直接 HTTP 抓取 (未配置 RENDER_ENDPOINT)"),
    }

    // ----------------------------------------------------------------
    // 2. 组装流水线
    // ----------------------------------------------------------------
    let detector = Detector::new(
        Fetcher::new(loader, config.fetch.clone()),
        Fingerprinter::new(config.fingerprint),
        corpus,
        DecisionEngine::new(config.policy),
        recorder,
    );
    let shared_state = Arc::new(api::AppState {
        detector: Arc::new(detector),
    });

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("🚀 API 服务已运行在: http://{}", addr);
    info!("   - POST /detect            : 检测 URL 是否侵权");
    info!("   - POST /works             : 登记原创作品");
    info!("   - GET  /results/{{id}}/verify : 复核存证");
    info!("   - GET  /audit/{{pos}}       : 获取特定位置的 Merkle Proof");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("🛑 收到退出信号，停止接收新请求");
        })
        .await?;

    db.flush_async().await?;
    info!("💾 数据已落盘，退出");
    Ok(())
}
