/// 集群运行时配置
///
/// 配置项是一个封闭集合：未知名称与无法解析的值都会被拒绝。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::models::constants::*;

/// 可识别的配置项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    /// 主控负责的哈希桶比例（0-255）
    DhcpFailoverSplit,
    /// 多久收不到对端消息即进入 DEGRADED（秒）
    MaxResponseDelay,
    /// 允许未确认的复制更新条数，超过后全量重同步
    MaxUnackedUpdates,
    /// 客户端 secs 字段达到该值后任一对端都可应答
    LoadBalanceMaxSeconds,
    /// 电源操作硬超时（秒）
    PowerTimeout,
    /// 查询等待进行中电源变更的时长（秒）
    PowerQueryWait,
    /// 控制器心跳间隔（秒）
    HeartbeatInterval,
    /// 心跳丢失多少次判定离线
    HeartbeatMissThreshold,
    /// ACK 租约时长（秒）
    LeaseTime,
    /// OFFER 保留时长（秒）
    OfferTimeout,
}

impl SettingKey {
    pub const ALL: [SettingKey; 10] = [
        SettingKey::DhcpFailoverSplit,
        SettingKey::MaxResponseDelay,
        SettingKey::MaxUnackedUpdates,
        SettingKey::LoadBalanceMaxSeconds,
        SettingKey::PowerTimeout,
        SettingKey::PowerQueryWait,
        SettingKey::HeartbeatInterval,
        SettingKey::HeartbeatMissThreshold,
        SettingKey::LeaseTime,
        SettingKey::OfferTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::DhcpFailoverSplit => "dhcp_failover_split",
            SettingKey::MaxResponseDelay => "max_response_delay",
            SettingKey::MaxUnackedUpdates => "max_unacked_updates",
            SettingKey::LoadBalanceMaxSeconds => "load_balance_max_seconds",
            SettingKey::PowerTimeout => "power_timeout",
            SettingKey::PowerQueryWait => "power_query_wait",
            SettingKey::HeartbeatInterval => "heartbeat_interval",
            SettingKey::HeartbeatMissThreshold => "heartbeat_miss_threshold",
            SettingKey::LeaseTime => "lease_time",
            SettingKey::OfferTimeout => "offer_timeout",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // 兼容 `max-response-delay` 写法
        let normalized = s.trim().replace('-', "_");
        SettingKey::ALL
            .iter()
            .find(|k| k.as_str() == normalized)
            .copied()
            .ok_or_else(|| Error::UnknownSetting(s.to_string()))
    }
}

/// 集群配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterSettings {
    pub dhcp_failover_split: u8,
    pub max_response_delay: u64,
    pub max_unacked_updates: usize,
    pub load_balance_max_seconds: u16,
    pub power_timeout: u64,
    pub power_query_wait: u64,
    pub heartbeat_interval: u64,
    pub heartbeat_miss_threshold: u32,
    pub lease_time: u64,
    pub offer_timeout: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            dhcp_failover_split: DEFAULT_FAILOVER_SPLIT,
            max_response_delay: DEFAULT_MAX_RESPONSE_DELAY,
            max_unacked_updates: DEFAULT_MAX_UNACKED_UPDATES,
            load_balance_max_seconds: DEFAULT_LOAD_BALANCE_MAX_SECONDS,
            power_timeout: DEFAULT_POWER_TIMEOUT,
            power_query_wait: DEFAULT_POWER_QUERY_WAIT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_miss_threshold: DEFAULT_HEARTBEAT_MISS_THRESHOLD,
            lease_time: DEFAULT_LEASE_TIME,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
        }
    }
}

fn parse_value<T: FromStr>(key: SettingKey, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        Error::InvalidArgument(format!("配置项 {} 的值无效: {}", key, value))
    })
}

fn parse_positive(key: SettingKey, value: &str) -> Result<u64> {
    let v: u64 = parse_value(key, value)?;
    if v == 0 {
        return Err(Error::InvalidArgument(format!("配置项 {} 必须大于 0", key)));
    }
    Ok(v)
}

impl ClusterSettings {
    /// 按名称设置，返回解析后的键
    pub fn set(&mut self, name: &str, value: &str) -> Result<SettingKey> {
        let key: SettingKey = name.parse()?;
        match key {
            SettingKey::DhcpFailoverSplit => self.dhcp_failover_split = parse_value(key, value)?,
            SettingKey::MaxResponseDelay => self.max_response_delay = parse_positive(key, value)?,
            SettingKey::MaxUnackedUpdates => {
                self.max_unacked_updates = parse_positive(key, value)? as usize
            }
            SettingKey::LoadBalanceMaxSeconds => {
                self.load_balance_max_seconds = parse_value(key, value)?
            }
            SettingKey::PowerTimeout => self.power_timeout = parse_positive(key, value)?,
            SettingKey::PowerQueryWait => self.power_query_wait = parse_value(key, value)?,
            SettingKey::HeartbeatInterval => self.heartbeat_interval = parse_positive(key, value)?,
            SettingKey::HeartbeatMissThreshold => {
                self.heartbeat_miss_threshold = parse_positive(key, value)? as u32
            }
            SettingKey::LeaseTime => self.lease_time = parse_positive(key, value)?,
            SettingKey::OfferTimeout => self.offer_timeout = parse_positive(key, value)?,
        }
        Ok(key)
    }

    /// 以字符串形式读取
    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::DhcpFailoverSplit => self.dhcp_failover_split.to_string(),
            SettingKey::MaxResponseDelay => self.max_response_delay.to_string(),
            SettingKey::MaxUnackedUpdates => self.max_unacked_updates.to_string(),
            SettingKey::LoadBalanceMaxSeconds => self.load_balance_max_seconds.to_string(),
            SettingKey::PowerTimeout => self.power_timeout.to_string(),
            SettingKey::PowerQueryWait => self.power_query_wait.to_string(),
            SettingKey::HeartbeatInterval => self.heartbeat_interval.to_string(),
            SettingKey::HeartbeatMissThreshold => self.heartbeat_miss_threshold.to_string(),
            SettingKey::LeaseTime => self.lease_time.to_string(),
            SettingKey::OfferTimeout => self.offer_timeout.to_string(),
        }
    }

    /// 心跳超时：间隔 × 丢失阈值
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval * self.heartbeat_miss_threshold as u64)
    }

    pub fn power_timeout(&self) -> Duration {
        Duration::from_secs(self.power_timeout)
    }

    pub fn power_query_wait(&self) -> Duration {
        Duration::from_secs(self.power_query_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ClusterSettings::default();
        assert_eq!(settings.dhcp_failover_split, 255);
        assert_eq!(settings.max_response_delay, 60);
        assert_eq!(settings.heartbeat_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_set_known_key() {
        let mut settings = ClusterSettings::default();
        let key = settings.set("dhcp_failover_split", "128").unwrap();
        assert_eq!(key, SettingKey::DhcpFailoverSplit);
        assert_eq!(settings.dhcp_failover_split, 128);

        settings.set("max-response-delay", "30").unwrap();
        assert_eq!(settings.get(SettingKey::MaxResponseDelay), "30");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut settings = ClusterSettings::default();
        let err = settings.set("enable_magic", "true").unwrap_err();
        assert!(matches!(err, Error::UnknownSetting(_)));
        assert_eq!(settings, ClusterSettings::default());
    }

    #[test]
    fn test_invalid_value_rejected() {
        let mut settings = ClusterSettings::default();
        assert!(settings.set("dhcp_failover_split", "256").is_err());
        assert!(settings.set("power_timeout", "0").is_err());
        assert!(settings.set("lease_time", "soon").is_err());
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let ok: ClusterSettings = serde_json::from_str(r#"{"lease_time": 300}"#).unwrap();
        assert_eq!(ok.lease_time, 300);
        assert_eq!(ok.dhcp_failover_split, 255);

        let bad = serde_json::from_str::<ClusterSettings>(r#"{"lease_tme": 300}"#);
        assert!(bad.is_err());
    }
}
