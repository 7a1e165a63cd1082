// 配置管理模块

use crate::netdisk::error::{PCS_BLOCK_MISS_IN_SUPERFILE, PCS_INSERT_REQUEST_FORBID, PCS_REFUSE_SERVICE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 百度网盘默认应用 ID
pub const DEFAULT_APP_ID: u32 = 266719;

/// 默认上传分片大小: 10MB（5 * 2e6 字节）
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 10_000_000;

/// 网盘客户端 User-Agent
pub const NETDISK_USER_AGENT: &str = "netdisk;2.2.51.6;netdisk;10.0.63;PC;android-android";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// PCS 接口配置
    #[serde(default)]
    pub pcs: PcsConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 限流配置
    #[serde(default)]
    pub rate_control: RateControlConfig,
    /// 远端错误码分类表
    #[serde(default)]
    pub remote_codes: RemoteCodeConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// PCS 接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcsConfig {
    /// BDUSS（登录凭证）
    #[serde(default)]
    pub bduss: String,
    /// STOKEN（登录凭证，同样位于 Cookie 中）
    #[serde(default)]
    pub stoken: String,
    /// 应用 ID
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// PCS 服务地址
    #[serde(default = "default_pcs_base_url")]
    pub pcs_base_url: String,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 非分片请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_app_id() -> u32 {
    DEFAULT_APP_ID
}

fn default_pcs_base_url() -> String {
    "https://pcs.baidu.com".to_string()
}

fn default_user_agent() -> String {
    NETDISK_USER_AGENT.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for PcsConfig {
    fn default() -> Self {
        Self {
            bduss: String::new(),
            stoken: String::new(),
            app_id: default_app_id(),
            pcs_base_url: default_pcs_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// 缓冲池容量计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSizing {
    /// 按最大上传线程数
    ThreadCount,
    /// 按内存预算 / 分片大小
    MemoryBudget,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大上传线程数（越大越容易造成网络拥塞）
    #[serde(default = "default_max_upload_thread_count")]
    pub max_upload_thread_count: usize,
    /// 分片大小（字节）
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: u64,
    /// 上传缓冲内存预算（字节），仅 memory_budget 模式使用
    #[serde(default)]
    pub buf_mem_limit: u64,
    /// 缓冲池容量计算方式
    #[serde(default = "default_pool_sizing")]
    pub pool_sizing: PoolSizing,
    /// 单个分片最大尝试次数
    #[serde(default = "default_chunk_max_attempts")]
    pub chunk_max_attempts: u32,
    /// 占位文件 / 合并分片 / 单请求上传最大尝试次数
    #[serde(default = "default_commit_max_attempts")]
    pub commit_max_attempts: u32,
    /// 是否校验服务端返回的分片 MD5
    #[serde(default = "default_verify_chunk_md5")]
    pub verify_chunk_md5: bool,
}

fn default_max_upload_thread_count() -> usize {
    3
}

fn default_upload_chunk_size() -> u64 {
    DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_pool_sizing() -> PoolSizing {
    PoolSizing::ThreadCount
}

fn default_chunk_max_attempts() -> u32 {
    5
}

fn default_commit_max_attempts() -> u32 {
    3
}

fn default_verify_chunk_md5() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_thread_count: default_max_upload_thread_count(),
            upload_chunk_size: default_upload_chunk_size(),
            buf_mem_limit: 0,
            pool_sizing: default_pool_sizing(),
            chunk_max_attempts: default_chunk_max_attempts(),
            commit_max_attempts: default_commit_max_attempts(),
            verify_chunk_md5: default_verify_chunk_md5(),
        }
    }
}

impl UploadConfig {
    /// 缓冲池槽位数
    pub fn pool_size(&self) -> usize {
        match self.pool_sizing {
            PoolSizing::ThreadCount => self.max_upload_thread_count.max(1),
            PoolSizing::MemoryBudget => {
                let count = self.buf_mem_limit / self.upload_chunk_size.max(1);
                (count as usize).max(1)
            }
        }
    }

    /// 校验上传配置
    pub fn validate(&self) -> Result<()> {
        if self.upload_chunk_size == 0 {
            anyhow::bail!("upload_chunk_size 必须大于 0");
        }
        if usize::try_from(self.upload_chunk_size).is_err() {
            anyhow::bail!("upload_chunk_size 超出本机可寻址范围: {}", self.upload_chunk_size);
        }
        if self.max_upload_thread_count == 0 {
            anyhow::bail!("max_upload_thread_count 必须至少为 1");
        }
        if self.pool_sizing == PoolSizing::MemoryBudget && self.buf_mem_limit < self.upload_chunk_size {
            anyhow::bail!(
                "buf_mem_limit ({}) 小于一个分片 ({})，无法分配缓冲",
                self.buf_mem_limit,
                self.upload_chunk_size
            );
        }
        if self.chunk_max_attempts == 0 || self.commit_max_attempts == 0 {
            anyhow::bail!("重试次数配置必须至少为 1");
        }
        Ok(())
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateControlConfig {
    /// 删除类请求最小间隔（毫秒）
    #[serde(default = "default_deleting_interval_ms")]
    pub deleting_interval_ms: u64,
    /// 创建类请求（占位文件、合并分片）最小间隔（毫秒）
    #[serde(default = "default_creating_interval_ms")]
    pub creating_interval_ms: u64,
    /// 分片重试最小间隔（毫秒）
    #[serde(default = "default_uploading_interval_ms")]
    pub uploading_interval_ms: u64,
    /// 冷却时长（秒）
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// 失败窗口容量
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// 触发冷却的失败次数
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// 失败记录保留时长（以请求间隔为单位）
    #[serde(default = "default_retention_intervals")]
    pub retention_intervals: u32,
    /// 服务拒绝错误码
    #[serde(default = "default_refuse_service_code")]
    pub refuse_service_code: i64,
}

fn default_deleting_interval_ms() -> u64 {
    500
}

fn default_creating_interval_ms() -> u64 {
    300
}

fn default_uploading_interval_ms() -> u64 {
    200
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_window_capacity() -> usize {
    6
}

fn default_failure_threshold() -> usize {
    5
}

fn default_retention_intervals() -> u32 {
    6
}

fn default_refuse_service_code() -> i64 {
    PCS_REFUSE_SERVICE
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            deleting_interval_ms: default_deleting_interval_ms(),
            creating_interval_ms: default_creating_interval_ms(),
            uploading_interval_ms: default_uploading_interval_ms(),
            cooldown_secs: default_cooldown_secs(),
            window_capacity: default_window_capacity(),
            failure_threshold: default_failure_threshold(),
            retention_intervals: default_retention_intervals(),
            refuse_service_code: default_refuse_service_code(),
        }
    }
}

impl RateControlConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.deleting_interval_ms == 0
            || self.creating_interval_ms == 0
            || self.uploading_interval_ms == 0
        {
            anyhow::bail!("限流间隔必须大于 0");
        }
        if self.failure_threshold == 0 || self.failure_threshold > self.window_capacity {
            anyhow::bail!(
                "failure_threshold ({}) 必须在 1..={} 之间",
                self.failure_threshold,
                self.window_capacity
            );
        }
        Ok(())
    }
}

/// 远端错误码分类表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCodeConfig {
    /// 合并分片时应重试的错误码（31363 分片状态过期，31200 Insert Request Forbid）
    #[serde(default = "default_merge_retry_codes")]
    pub merge_retry_codes: Vec<i64>,
    /// 直接失败、不再重试的错误码
    #[serde(default)]
    pub fatal_codes: Vec<i64>,
}

fn default_merge_retry_codes() -> Vec<i64> {
    vec![PCS_BLOCK_MISS_IN_SUPERFILE, PCS_INSERT_REQUEST_FORBID]
}

impl Default for RemoteCodeConfig {
    fn default() -> Self {
        Self {
            merge_retry_codes: default_merge_retry_codes(),
            fatal_codes: Vec::new(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 校验整体配置
    pub fn validate(&self) -> Result<()> {
        self.upload.validate().context("上传配置无效")?;
        self.rate_control.validate().context("限流配置无效")?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content)
            .await
            .context("写入配置文件失败")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_upload_thread_count, 3);
        assert_eq!(config.upload.upload_chunk_size, 10_000_000);
        assert_eq!(config.upload.chunk_max_attempts, 5);
        assert_eq!(config.upload.commit_max_attempts, 3);
        assert_eq!(config.pcs.app_id, 266719);
        assert_eq!(config.rate_control.cooldown_secs, 10);
        assert_eq!(config.rate_control.window_capacity, 6);
        assert_eq!(config.remote_codes.merge_retry_codes, vec![31363, 31200]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_pool_size_modes() {
        let mut upload = UploadConfig {
            max_upload_thread_count: 4,
            upload_chunk_size: 5 * 1024 * 1024,
            buf_mem_limit: 32 * 1024 * 1024,
            ..UploadConfig::default()
        };
        assert_eq!(upload.pool_size(), 4);

        upload.pool_sizing = PoolSizing::MemoryBudget;
        assert_eq!(upload.pool_size(), 6);
        assert!(upload.validate().is_ok());

        upload.buf_mem_limit = 1024;
        assert!(upload.validate().is_err());
    }

    #[test]
    fn test_invalid_upload_config() {
        let upload = UploadConfig {
            upload_chunk_size: 0,
            ..UploadConfig::default()
        };
        assert!(upload.validate().is_err());

        let upload = UploadConfig {
            max_upload_thread_count: 0,
            ..UploadConfig::default()
        };
        assert!(upload.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [pcs]
            bduss = "abc"

            [upload]
            max_upload_thread_count = 8
            pool_sizing = "memory_budget"
            buf_mem_limit = 100000000
            "#,
        )
        .unwrap();

        assert_eq!(config.pcs.bduss, "abc");
        assert_eq!(config.pcs.pcs_base_url, "https://pcs.baidu.com");
        assert_eq!(config.upload.max_upload_thread_count, 8);
        assert_eq!(config.upload.pool_size(), 10);
        assert_eq!(config.rate_control.failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.pcs.bduss = "bduss-value".to_string();
        config.upload.verify_chunk_md5 = false;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.pcs.bduss, "bduss-value");
        assert!(!loaded.upload.verify_chunk_md5);
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        let path_str = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path_str).await;
        assert_eq!(config.upload.max_upload_thread_count, 3);
        assert!(path.exists());
    }
}
