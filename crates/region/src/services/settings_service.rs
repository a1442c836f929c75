/// 集群配置服务

use chrono::Utc;
use common::settings::{ClusterSettings, SettingKey};
use common::Result;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::setting;

#[derive(Debug, Deserialize)]
pub struct SetSettingDto {
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SettingResponse {
    pub name: String,
    pub value: String,
}

pub struct SettingsService {
    state: AppState,
}

impl SettingsService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 从数据库载入配置；库里不认识的配置项跳过
    pub async fn load(db: &DatabaseConnection) -> Result<ClusterSettings> {
        let rows = setting::Entity::find().all(db).await.map_err(db_err)?;
        Ok(apply_rows(rows.into_iter().map(|r| (r.name, r.value))))
    }

    pub async fn list_settings(&self) -> BTreeMap<String, String> {
        let settings = self.state.membership.settings().await;
        SettingKey::ALL
            .iter()
            .map(|key| (key.as_str().to_string(), settings.get(*key)))
            .collect()
    }

    /// 修改配置并下发到所有机架
    pub async fn set_setting(&self, name: &str, value: &str) -> Result<SettingResponse> {
        let mut settings = self.state.membership.settings().await;
        let key = settings.set(name, value)?;
        let value = settings.get(key);

        let row = setting::ActiveModel {
            name: Set(key.as_str().to_string()),
            value: Set(value.clone()),
            updated_at: Set(Utc::now().into()),
        };
        setting::Entity::insert(row)
            .on_conflict(
                OnConflict::column(setting::Column::Name)
                    .update_columns([setting::Column::Value, setting::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;

        self.state.membership.apply_settings(settings).await;
        info!("⚙️ 配置已更新: {}={}", key, value);

        let pushed = self
            .state
            .rack_manager
            .push_configuration_all(&self.state.membership)
            .await;
        info!("配置已下发到 {} 个机架", pushed);

        Ok(SettingResponse {
            name: key.as_str().to_string(),
            value,
        })
    }
}

fn apply_rows(rows: impl IntoIterator<Item = (String, String)>) -> ClusterSettings {
    let mut settings = ClusterSettings::default();
    for (name, value) in rows {
        if let Err(e) = settings.set(&name, &value) {
            warn!("忽略数据库中的配置项 {}={}: {}", name, value, e);
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_rows_skips_invalid() {
        let settings = apply_rows(vec![
            ("dhcp_failover_split".to_string(), "128".to_string()),
            ("power_timeout".to_string(), "0".to_string()),
            ("no_such_setting".to_string(), "1".to_string()),
        ]);
        assert_eq!(settings.dhcp_failover_split, 128);
        assert_eq!(settings.power_timeout, ClusterSettings::default().power_timeout);
    }
}
