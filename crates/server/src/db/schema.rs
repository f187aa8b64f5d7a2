/// 根据实体定义建表
///
/// 仅用于开发环境与测试，生产环境的表结构由外部迁移管理

use common::Result;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, Schema};
use tracing::info;

use super::models::{deployment_history, network_allocation, node};

/// 创建所有表及索引（已存在则跳过）
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let schema = Schema::new(db.get_database_backend());

    // nodes 必须先于 network_allocations（外键）
    create_entity_table(db, &schema, node::Entity).await?;
    create_entity_table(db, &schema, network_allocation::Entity).await?;
    create_entity_table(db, &schema, deployment_history::Entity).await?;

    info!("数据表已就绪");
    Ok(())
}

async fn create_entity_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait + Copy,
{
    let backend = db.get_database_backend();

    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    db.execute(backend.build(&table)).await?;

    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }

    Ok(())
}
