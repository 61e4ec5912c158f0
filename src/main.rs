// src/main.rs

use axum::{
    routing::{get, post},
    serve, Router,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod api;
mod auction;
mod config;
mod logging;
mod mock_partner;
mod model;
mod sandbox;
mod store;

use config::config_manager::{AuctionSettings, ConfigManager};
use logging::runtime_logger::RuntimeLogger;
use model::adapters::{ConfigAdapter, FileConfigAdapter};
use sandbox::BiddingSandbox;
use store::interest_groups::InterestGroupStore;
use store::storage::{LocalStorage, ScopedStorage};

#[derive(Clone)]
pub struct AppState {
    pub runtime_logger: Arc<RuntimeLogger>,
    pub config: Arc<ConfigManager>,
    pub storage: ScopedStorage,
    pub store: Arc<InterestGroupStore>,
    pub sandbox: Arc<BiddingSandbox>,
}

#[derive(Parser, Debug)]
#[command(author = "whiteCcinn", version = "1.0", about = "An on-device TURTLEDOVE ad auction engine")]
struct CliArgs {
    #[arg(short, long, default_value_t = 8008)]
    port: u16,
    #[arg(long, default_value_t = 8007)]
    partner_port: u16,
    #[arg(long, default_value = "logs")]
    log_dir: String,
    #[arg(long, default_value = "storage/turtledove-store.json")]
    storage_file: String,
    #[arg(long, default_value = "static/partners.json")]
    partners_file: String,
    /// 逗号分隔的伙伴 base URL，覆盖 partners.json
    #[arg(long)]
    partners: Option<String>,
    #[arg(long, default_value_t = false)]
    disable_product_level: bool,
}

#[tokio::main]
async fn main() {
    // 设置环境变量 TZ 为东八区
    std::env::set_var("TZ", "Asia/Shanghai");

    let args = CliArgs::parse();

    // 启动 Mock 伙伴服务器（监听 8007 端口）
    let partner_port = args.partner_port;
    let partner_mock_server = tokio::spawn(async move {
        mock_partner::start_mock_partner_server(partner_port).await;
    });

    // 初始化全局 tracing 日志
    let log_file = rolling::hourly(&args.log_dir, "turtledove_log.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().json().with_writer(non_blocking));
    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set global tracing subscriber");
    info!("TURTLEDOVE engine starting on port {}", args.port);

    // 初始化运行日志记录器（用于记录服务运行状态、调试、错误等）
    let runtime_logger = RuntimeLogger::new(&args.log_dir, "runtime", 1000, 100, 1000);
    runtime_logger.log("INFO", "TURTLEDOVE engine is starting...").await;

    // 伙伴配置：CLI 覆盖 > partners.json > proptest 生成的演示注册表
    let settings = AuctionSettings {
        product_level_enabled: !args.disable_product_level,
        ..Default::default()
    };
    let config = match &args.partners {
        Some(urls) => Arc::new(ConfigManager::from_args(urls, settings.clone())),
        None => {
            let adapter = FileConfigAdapter::new(&args.partners_file);
            let config = Arc::new(ConfigManager::new(Default::default(), settings.clone()));
            let partners = adapter.get_partners();
            if partners.is_empty() {
                config.update_partners(model::partner::init().active_partners());
            } else {
                config.update_partners(partners);
            }
            config
        }
    };

    // 打开 origin 作用域的存储；文件不可用时已在内部告警并降级
    let local_storage = LocalStorage::open(Some(PathBuf::from(&args.storage_file)));
    let storage = ScopedStorage::new(
        local_storage.clone(),
        &format!("http://localhost:{}", args.port),
    );
    let ig_store = Arc::new(InterestGroupStore::new(storage.clone(), settings));
    let bidding_sandbox = Arc::new(BiddingSandbox::default());

    let state = Arc::new(AppState {
        runtime_logger: runtime_logger.clone(),
        config: config.clone(),
        storage: storage.clone(),
        store: ig_store.clone(),
        sandbox: bidding_sandbox.clone(),
    });

    let engine_server = tokio::spawn({
        let state = state.clone();
        let port = args.port;
        let runtime_logger = runtime_logger.clone();
        async move {
            let app = Router::new()
                .route("/join", post(api::handlers::handle_join_request))
                .route("/leave", post(api::handlers::handle_leave_request))
                .route("/render", post(api::handlers::handle_render_request))
                .route("/winners", get(api::handlers::handle_list_winners))
                .with_state(state);
            let addr = format!("0.0.0.0:{}", port);
            runtime_logger
                .log("INFO", &format!("TURTLEDOVE engine running at http://{}", addr))
                .await;
            let listener = TcpListener::bind(&addr).await.unwrap();
            serve(listener, app).await.unwrap();
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            runtime_logger.log("INFO", "Shutting down gracefully...").await;
        }
    }

    // 关停前把存储刷到磁盘
    local_storage.flush();
    runtime_logger.shutdown().await;
    tokio::try_join!(engine_server, partner_mock_server).unwrap();
    runtime_logger.log("INFO", "TURTLEDOVE engine shut down.").await;
}
