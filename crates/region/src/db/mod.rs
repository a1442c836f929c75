/// 数据库访问层

pub mod models;

use common::Error;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;
use tracing::info;

use models::{controller, fabric, host_reservation, ip_range, machine, setting, subnet, vlan};

/// SeaORM 错误转为统一错误
pub fn db_err(err: DbErr) -> Error {
    Error::Database(err.to_string())
}

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(
    database_url: &str,
    max_connections: u32,
) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库: max_connections={}", max_connections);

    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 按实体定义建表（已存在则跳过）
pub async fn create_schema(db: &DatabaseConnection) -> Result<(), anyhow::Error> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let statements = [
        schema.create_table_from_entity(fabric::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(vlan::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(subnet::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(ip_range::Entity).if_not_exists().to_owned(),
        schema
            .create_table_from_entity(host_reservation::Entity)
            .if_not_exists()
            .to_owned(),
        schema.create_table_from_entity(controller::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(machine::Entity).if_not_exists().to_owned(),
        schema.create_table_from_entity(setting::Entity).if_not_exists().to_owned(),
    ];

    for statement in &statements {
        db.execute(backend.build(statement)).await?;
    }

    info!("✅ 数据库表已就绪: {} 张", statements.len());
    Ok(())
}
