/// 数据库实体
///
/// 每张表一个 SeaORM 实体，`TryFrom<Model>` 转为共享模型，`from_domain` 生成写入用的 ActiveModel

pub mod controller;
pub mod fabric;
pub mod host_reservation;
pub mod ip_range;
pub mod machine;
pub mod setting;
pub mod subnet;
pub mod vlan;

use common::Error;
use std::net::Ipv4Addr;

/// 数据库中的地址字段解析失败说明数据被外部改坏
pub(crate) fn parse_ip(table: &str, value: &str) -> Result<Ipv4Addr, Error> {
    value
        .parse()
        .map_err(|_| Error::Database(format!("{} 中的地址无效: {}", table, value)))
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
