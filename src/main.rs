pub mod config;
pub mod error;
pub mod gateway;
pub mod key_pool;
pub mod logging;
pub mod upstream;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load().context("读取环境变量配置失败")?;

    init_tracing(&cfg);

    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("配置校验失败")?;

    let pool = Arc::new(key_pool::KeyPool::new(
        &cfg.api_keys,
        cfg.default_rpd_limit,
        cfg.default_rpm_limit,
    ));
    tracing::info!(
        "Key 池已初始化：{} 个 Key（RPD={}，RPM={}）",
        cfg.api_keys.len(),
        cfg.default_rpd_limit,
        cfg.default_rpm_limit
    );

    // 没有流量时也要按太平洋时间日界重置，保证状态接口的数据准确。
    key_pool::spawn_daily_reset_task(pool.clone());

    let upstream = upstream::UpstreamClient::new(&cfg).context("初始化上游客户端失败")?;

    let proxy_state = Arc::new(gateway::proxy::ProxyState {
        forwarder: gateway::proxy::Forwarder::new(pool.clone(), upstream),
        policy: gateway::proxy::RetryPolicy {
            max_attempts: cfg.max_retries,
            retry_delay: cfg.retry_delay,
        },
        log_level: cfg.detail_log_level(),
    });

    let app = gateway::build_router(pool, proxy_state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!(
        "{} listening on http://{addr}，上游 {}",
        gateway::SERVICE_NAME,
        cfg.gemini_base_url
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // RUST_LOG 优先；否则依赖库只输出 warn，本项目按 LOG_LEVEL。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        let level = cfg.log_level.trim().to_lowercase();
        EnvFilter::try_new(format!("warn,gemini_keypool={level}"))
            .unwrap_or_else(|_| EnvFilter::new("warn,gemini_keypool=info"))
    } else {
        EnvFilter::new(env)
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
