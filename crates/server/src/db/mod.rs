/// 数据库访问层

pub mod models;
pub mod schema;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库: {}", database_url);

    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    // 内存 SQLite 每个连接都是独立的库
    if database_url.starts_with("sqlite::memory:") {
        options.max_connections(1).min_connections(1);
    }

    let db = Database::connect(options).await?;
    info!("数据库连接成功");

    Ok(db)
}
