/// HCI Provisioner - Server
///
/// 节点部署编排服务主程序

use provisioner_server::{
    app_state::AppState,
    build_router,
    cloud::build_provider,
    config::Config,
    db::{establish_connection, schema::create_tables},
};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = Config::from_env()?;

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(filter);
    if cfg.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("🚀 启动 HCI Provisioner Server...");
    info!("✅ 配置加载成功: cloud_provider={}", cfg.cloud.provider);

    // 建立数据库连接
    let sea_db = establish_connection(&cfg.database_url).await?;
    info!("✅ 数据库连接成功");

    if cfg.auto_migrate {
        create_tables(&sea_db).await?;
    }

    // 云资源 provider
    let cloud = build_provider(&cfg)?;
    info!("✅ 云 provider 初始化成功: {}", cloud.provider_type());

    let port = cfg.server_port;
    let app_state = AppState::new(sea_db, cloud, cfg);
    let app = build_router(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
