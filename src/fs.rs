// 网盘文件系统
//
// 以一个网盘根目录为基准，对外提供对象级的写入和删除：
// - put: 上传对象（经过上传引擎）
// - remove / rmdir / purge: 删除对象、目录或整个根目录（经过 deleting 限流）
// - open: 不支持下载

use crate::config::AppConfig;
use crate::error::UploadError;
use crate::netdisk::{ErrorClassifier, PcsApi, PcsClient, PcsError};
use crate::uploader::{BufferPool, RateCategory, RateControlRegistry, UploadEngine, UploadJob};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 文件系统错误
#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("删除失败: {0}")]
    Remove(#[source] PcsError),

    #[error("不支持下载")]
    DownloadUnsupported,
}

/// 网盘上的对象
#[derive(Debug, Clone, Serialize)]
pub struct RemoteObject {
    /// 相对根目录的路径
    pub remote: String,
    /// 网盘绝对路径
    pub absolute_path: String,
    /// 文件大小
    pub size: u64,
    /// 修改时间
    pub mod_time: DateTime<Utc>,
    /// 上传任务记录
    pub job: UploadJob,
}

/// 拼接网盘路径，返回以 `/` 开头的规范化绝对路径
pub fn join_remote_path(root: &str, remote: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for part in root.split('/').chain(remote.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            part => segments.push(part),
        }
    }
    format!("/{}", segments.join("/"))
}

/// 网盘文件系统
pub struct BaiduFs {
    /// 网盘根目录（绝对路径）
    root: String,
    api: Arc<dyn PcsApi>,
    engine: Arc<UploadEngine>,
    rate: Arc<RateControlRegistry>,
    classifier: Arc<ErrorClassifier>,
}

impl BaiduFs {
    /// 创建文件系统实例
    ///
    /// 缓冲池和限流器在实例内所有上传之间共享
    pub fn new(root: &str, api: Arc<dyn PcsApi>, config: &AppConfig) -> Self {
        let pool = BufferPool::from_config(&config.upload);
        let rate = Arc::new(RateControlRegistry::new(config.rate_control.clone()));
        let classifier = Arc::new(ErrorClassifier::from_config(
            &config.remote_codes,
            &config.rate_control,
        ));
        let engine = UploadEngine::from_config(api.clone(), pool, rate.clone(), config);

        let root = join_remote_path(root, "");
        info!(
            "初始化网盘文件系统: root={}, 分片大小={} bytes, 缓冲池容量={}",
            root,
            engine.chunk_size(),
            engine.pool().size()
        );

        Self {
            root,
            api,
            engine: Arc::new(engine),
            rate,
            classifier,
        }
    }

    /// 按配置创建，使用真实的 PCS 客户端
    pub fn from_config(root: &str, config: &AppConfig) -> Result<Self> {
        config.validate().context("配置无效")?;
        let client = PcsClient::new(&config.pcs).context("创建 PCS 客户端失败")?;
        Ok(Self::new(root, Arc::new(client), config))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn engine(&self) -> &Arc<UploadEngine> {
        &self.engine
    }

    /// 相对路径对应的网盘绝对路径
    pub fn absolute_path(&self, remote: &str) -> String {
        join_remote_path(&self.root, remote)
    }

    /// 上传对象
    pub async fn put<R>(
        &self,
        remote: &str,
        reader: &mut R,
        size: u64,
        mod_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject, FsError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let absolute_path = self.absolute_path(remote);
        debug!("Put: {}", absolute_path);

        let uploaded = self
            .engine
            .upload(&absolute_path, reader, size, mod_time, cancel)
            .await?;

        Ok(RemoteObject {
            remote: remote.to_string(),
            absolute_path,
            size: uploaded.size,
            mod_time: uploaded.mod_time,
            job: uploaded.job,
        })
    }

    /// 删除对象
    pub async fn remove(&self, remote: &str) -> Result<(), FsError> {
        let path = self.absolute_path(remote);
        debug!("Remove: {}", path);
        self.remove_path(path).await
    }

    /// 删除目录（包括目录下所有内容）
    pub async fn rmdir(&self, dir: &str) -> Result<(), FsError> {
        let path = self.absolute_path(dir);
        debug!("Rmdir: {}", path);
        self.remove_path(path).await
    }

    /// 删除整个根目录
    pub async fn purge(&self) -> Result<(), FsError> {
        debug!("Purge: {}", self.root);
        self.remove_path(self.root.clone()).await
    }

    /// 打开对象读取（不支持）
    pub async fn open(&self, remote: &str) -> Result<(), FsError> {
        warn!("不支持下载: {}", self.absolute_path(remote));
        Err(FsError::DownloadUnsupported)
    }

    async fn remove_path(&self, path: String) -> Result<(), FsError> {
        let rate = self.rate.get(RateCategory::Deleting);
        rate.wait().await;

        match self.api.remove(&[path]).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.classifier.is_throttled(&e) {
                    rate.record_failure();
                }
                warn!("删除失败: {}", e);
                Err(FsError::Remove(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::netdisk::error::PCS_REFUSE_SERVICE;
    use crate::netdisk::mock::{remote_error, MockPcs};
    use std::time::Duration;

    fn test_config() -> AppConfig {
        AppConfig {
            upload: UploadConfig {
                max_upload_thread_count: 2,
                upload_chunk_size: 100,
                ..UploadConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("apps/backup", "a/b.txt"), "/apps/backup/a/b.txt");
        assert_eq!(join_remote_path("/apps/backup/", "/a.txt"), "/apps/backup/a.txt");
        assert_eq!(join_remote_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote_path("", ""), "/");
        assert_eq!(join_remote_path("/apps", "./x/../y.txt"), "/apps/y.txt");
    }

    #[tokio::test]
    async fn test_put_joins_root() {
        let api = Arc::new(MockPcs::new());
        let fs = BaiduFs::new("backup", api.clone(), &test_config());
        assert_eq!(fs.root(), "/backup");

        let data = vec![1u8; 250];
        let object = fs
            .put("dir/a.bin", &mut data.as_slice(), 250, Utc::now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.remote, "dir/a.bin");
        assert_eq!(object.absolute_path, "/backup/dir/a.bin");
        assert_eq!(object.size, 250);
        assert_eq!(object.job.chunk_count, 3);
        assert_eq!(api.merge_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_rmdir_purge() {
        let api = Arc::new(MockPcs::new());
        let fs = BaiduFs::new("/backup", api.clone(), &test_config());

        fs.remove("a.txt").await.unwrap();
        fs.rmdir("old").await.unwrap();
        fs.purge().await.unwrap();

        assert_eq!(
            api.removed.lock().as_slice(),
            &["/backup/a.txt".to_string(), "/backup/old".to_string(), "/backup".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_error_is_reported() {
        let api = Arc::new(MockPcs::new().on_remove(|_, _| Err(remote_error(PCS_REFUSE_SERVICE))));
        let fs = BaiduFs::new("/", api.clone(), &test_config());

        let err = fs.remove("a.txt").await.unwrap_err();
        match err {
            FsError::Remove(e) => assert_eq!(e.remote_code(), Some(PCS_REFUSE_SERVICE)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_removes_trigger_deleting_cooldown() {
        let api = Arc::new(MockPcs::new().on_remove(|call, _| {
            if call < 5 {
                Err(remote_error(PCS_REFUSE_SERVICE))
            } else {
                Ok(())
            }
        }));
        let fs = BaiduFs::new("/", api.clone(), &test_config());
        let deleting = fs.rate.get(RateCategory::Deleting);

        for _ in 0..5 {
            assert!(fs.remove("a.txt").await.is_err());
        }
        let start = tokio::time::Instant::now();

        // 让后台的失败记录任务执行
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(deleting.cooldown_count(), 1);
        assert!(deleting.is_cooling_down());

        fs.remove("a.txt").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(api.remove_calls(), 6);
    }

    #[tokio::test]
    async fn test_open_unsupported() {
        let fs = BaiduFs::new("/", Arc::new(MockPcs::new()), &test_config());
        assert!(matches!(fs.open("a.txt").await, Err(FsError::DownloadUnsupported)));
    }
}
