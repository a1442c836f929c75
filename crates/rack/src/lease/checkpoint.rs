/// 租约检查点
///
/// ACK 状态的租约以 JSON 写入磁盘：先写临时文件再 rename，保证文件始终完整。

use chrono::{DateTime, Utc};
use common::models::Lease;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHECKPOINT_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    format: u32,
    written_at: DateTime<Utc>,
    leases: Vec<Lease>,
}

/// 检查点文件
#[derive(Debug, Clone)]
pub struct LeaseCheckpoint {
    path: PathBuf,
}

impl LeaseCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 原子写入
    pub async fn save(&self, leases: Vec<Lease>) -> Result<()> {
        let file = CheckpointFile {
            format: CHECKPOINT_FORMAT,
            written_at: Utc::now(),
            leases,
        };
        let data = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Internal(format!("创建检查点目录失败: {}", e)))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::Internal(format!("写入检查点失败: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Internal(format!("替换检查点失败: {}", e)))?;

        debug!("💾 检查点已写入: path={}, leases={}", self.path.display(), file.leases.len());
        Ok(())
    }

    /// 读取检查点；文件不存在时返回空
    pub async fn load(&self) -> Result<Vec<Lease>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("检查点不存在，从空租约表启动: {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::Internal(format!("读取检查点失败: {}", e))),
        };

        let file: CheckpointFile = serde_json::from_slice(&data)?;
        if file.format != CHECKPOINT_FORMAT {
            return Err(Error::Config(format!(
                "不支持的检查点格式: {}",
                file.format
            )));
        }

        info!(
            "✅ 从检查点恢复 {} 条租约 (写入于 {})",
            file.leases.len(),
            file.written_at
        );
        Ok(file.leases)
    }
}
