// 上传引擎
//
// 驱动单个对象的完整上传流程：
// 1. 空文件：只上传一个空的占位文件
// 2. 不超过一个分片：借缓冲区读入整个文件，单请求上传
// 3. 多分片：先创建占位文件，再按顺序读入分片并发上传，全部成功后合并
//
// 并发上传策略：
// - 缓冲池是唯一的并发限制，借不到缓冲区就不读取源数据
// - 源数据严格按分片顺序读取，分片 MD5 按索引写入，合并顺序与完成顺序无关
// - 每个任务一个子取消令牌，任一分片致命失败或重试耗尽都会取消整个任务
// - 第一个失败的分片错误作为任务结果，之后的错误丢弃
// - 源数据长度必须与声明的大小一致，过短或过长都会失败

use crate::config::AppConfig;
use crate::error::UploadError;
use crate::netdisk::{ErrorClassifier, FileMeta, PcsApi, PcsError, RetryDecision};
use crate::uploader::buffer::BufferPool;
use crate::uploader::chunk::{chunk_range, ChunkUploader};
use crate::uploader::rate_control::{RateCategory, RateControlRegistry};
use crate::uploader::task::UploadJob;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 占位文件 / 合并 / 单请求上传默认最大尝试次数
pub const DEFAULT_COMMIT_MAX_ATTEMPTS: u32 = 3;

/// 上传完成的对象
#[derive(Debug, Clone, Serialize)]
pub struct UploadedObject {
    /// 网盘路径
    pub remote_path: String,
    /// 文件大小
    pub size: u64,
    /// 修改时间
    pub mod_time: DateTime<Utc>,
    /// 服务端返回的元信息
    pub meta: FileMeta,
    /// 任务记录
    pub job: UploadJob,
}

/// 上传引擎
///
/// 可在多个并发上传之间共享，缓冲池和限流器都是全局共享的
pub struct UploadEngine {
    /// PCS 接口
    api: Arc<dyn PcsApi>,
    /// 上传缓冲池
    pool: Arc<BufferPool>,
    /// 限流控制器
    rate: Arc<RateControlRegistry>,
    /// 错误分类
    classifier: Arc<ErrorClassifier>,
    /// 单个分片最大尝试次数
    chunk_max_attempts: u32,
    /// 提交类请求最大尝试次数
    commit_max_attempts: u32,
    /// 是否校验分片 MD5
    verify_md5: bool,
}

impl UploadEngine {
    pub fn new(
        api: Arc<dyn PcsApi>,
        pool: Arc<BufferPool>,
        rate: Arc<RateControlRegistry>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            api,
            pool,
            rate,
            classifier,
            chunk_max_attempts: crate::uploader::chunk::DEFAULT_CHUNK_MAX_ATTEMPTS,
            commit_max_attempts: DEFAULT_COMMIT_MAX_ATTEMPTS,
            verify_md5: true,
        }
    }

    /// 按应用配置创建上传引擎
    pub fn from_config(
        api: Arc<dyn PcsApi>,
        pool: Arc<BufferPool>,
        rate: Arc<RateControlRegistry>,
        config: &AppConfig,
    ) -> Self {
        let classifier = ErrorClassifier::from_config(&config.remote_codes, &config.rate_control);
        Self::new(api, pool, rate, Arc::new(classifier))
            .with_max_attempts(
                config.upload.chunk_max_attempts,
                config.upload.commit_max_attempts,
            )
            .with_verify_md5(config.upload.verify_chunk_md5)
    }

    /// 设置重试次数
    pub fn with_max_attempts(mut self, chunk: u32, commit: u32) -> Self {
        self.chunk_max_attempts = chunk.max(1);
        self.commit_max_attempts = commit.max(1);
        self
    }

    pub fn with_verify_md5(mut self, verify: bool) -> Self {
        self.verify_md5 = verify;
        self
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// 分片大小（即缓冲区容量）
    pub fn chunk_size(&self) -> u64 {
        self.pool.slot_capacity() as u64
    }

    /// 上传一个对象
    ///
    /// `reader` 按顺序读取恰好 `size` 字节；`cancel` 为调用方的取消令牌，
    /// 任务内部使用其子令牌，内部取消不会影响调用方
    pub async fn upload<R>(
        &self,
        remote_path: &str,
        reader: &mut R,
        size: u64,
        mod_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut job = UploadJob::new(remote_path, size, self.chunk_size());
        let job_cancel = cancel.child_token();

        info!(
            "开始上传: remote={}, size={}, 分片数={}, 任务ID={}",
            remote_path, size, job.chunk_count, job.id
        );

        let result = self.run(&mut job, reader, &job_cancel).await;

        match result {
            Ok(meta) => {
                job.mark_completed();
                info!(
                    "上传完成: {} ({} bytes, {} 个分片)",
                    remote_path, size, job.chunk_count
                );
                Ok(UploadedObject {
                    remote_path: remote_path.to_string(),
                    size,
                    mod_time,
                    meta,
                    job,
                })
            }
            Err(UploadError::Cancelled) => {
                job.mark_cancelled();
                warn!("上传已取消: {}", remote_path);
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                job.mark_failed(e.to_string());
                error!("上传失败: {}, 错误: {}", remote_path, e);
                Err(e)
            }
        }
    }

    async fn run<R>(
        &self,
        job: &mut UploadJob,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<FileMeta, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let remote_path = job.remote_path.clone();

        if job.total_size == 0 {
            if has_trailing_bytes(reader).await? {
                return Err(UploadError::SizeMismatch {
                    expected: 0,
                    actual: 1,
                });
            }
            job.mark_creating_placeholder();
            return self.create_placeholder(&remote_path, cancel).await;
        }

        if job.is_single_request() {
            job.mark_uploading();
            return self.upload_single(&remote_path, reader, job.total_size, cancel).await;
        }

        job.mark_creating_placeholder();
        self.create_placeholder(&remote_path, cancel).await?;

        job.mark_uploading();
        let block_list = self.upload_chunks(job, reader, cancel).await?;

        job.mark_merging();
        info!("合并上传分片，创建文件: {} ({} 个分片)", remote_path, block_list.len());
        let api = &self.api;
        let path = remote_path.as_str();
        let blocks = block_list.as_slice();
        self.commit_with_retries("合并分片", cancel, UploadError::Merge, move || {
            api.create_super_file(path, blocks)
        })
        .await
    }

    /// 创建空的占位文件
    async fn create_placeholder(
        &self,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Result<FileMeta, UploadError> {
        debug!("创建占位文件: {}", remote_path);
        let api = &self.api;
        self.commit_with_retries("创建占位文件", cancel, UploadError::Placeholder, move || {
            api.upload_file(remote_path, &[])
        })
        .await
    }

    /// 单请求上传（整个对象不超过一个分片）
    async fn upload_single<R>(
        &self,
        remote_path: &str,
        reader: &mut R,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<FileMeta, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let Some(mut buffer) = self.pool.acquire(cancel).await else {
            return Err(UploadError::Cancelled);
        };

        let read = buffer.fill(reader, size as usize).await?;
        if read as u64 != size {
            return Err(UploadError::SizeMismatch {
                expected: size,
                actual: read as u64,
            });
        }
        if has_trailing_bytes(reader).await? {
            return Err(UploadError::SizeMismatch {
                expected: size,
                actual: size + 1,
            });
        }

        let api = &self.api;
        let data = buffer.bytes();
        self.commit_with_retries("单请求上传", cancel, UploadError::SingleUpload, move || {
            api.upload_file(remote_path, data)
        })
        .await
    }

    /// 并发上传所有分片，返回按分片顺序排列的 MD5 列表
    async fn upload_chunks<R>(
        &self,
        job: &mut UploadJob,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, UploadError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let chunk_count = job.chunk_count;
        let total_size = job.total_size;
        let chunk_size = job.chunk_size;

        info!(
            "[并发上传] 开始上传 {} 个分片，缓冲池容量: {}",
            chunk_count,
            self.pool.size()
        );

        let uploader = Arc::new(ChunkUploader::new(
            self.api.clone(),
            self.classifier.clone(),
            self.rate.get(RateCategory::Uploading),
            self.chunk_max_attempts,
            self.verify_md5,
        ));
        let remote_path: Arc<str> = Arc::from(job.remote_path.as_str());
        // 每个分片一个 MD5 槽位，只写一次
        let checksums: Arc<Vec<OnceLock<String>>> =
            Arc::new((0..chunk_count).map(|_| OnceLock::new()).collect());
        // 第一个失败的分片错误
        let first_error: Arc<OnceLock<UploadError>> = Arc::new(OnceLock::new());
        let completed = Arc::new(AtomicUsize::new(0));

        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut read_total = 0u64;

        for index in 0..chunk_count {
            let Some(mut buffer) = self.pool.acquire(cancel).await else {
                debug!("[并发上传] 等待缓冲区时任务被取消");
                break;
            };

            let range = chunk_range(index, total_size, chunk_size);
            let expected = (range.end - range.start) as usize;
            let read = match buffer.fill(reader, expected).await {
                Ok(read) => read,
                Err(e) => {
                    fail_job(&first_error, cancel, e.into());
                    break;
                }
            };
            read_total += read as u64;

            if read < expected {
                fail_job(
                    &first_error,
                    cancel,
                    UploadError::SizeMismatch {
                        expected: total_size,
                        actual: read_total,
                    },
                );
                break;
            }

            // 最后一个分片读满后，数据流应当已经结束
            if index + 1 == chunk_count {
                match has_trailing_bytes(reader).await {
                    Ok(false) => {}
                    Ok(true) => {
                        fail_job(
                            &first_error,
                            cancel,
                            UploadError::SizeMismatch {
                                expected: total_size,
                                actual: read_total + 1,
                            },
                        );
                        break;
                    }
                    Err(e) => {
                        fail_job(&first_error, cancel, e.into());
                        break;
                    }
                }
            }

            let task_uploader = uploader.clone();
            let task_path = remote_path.clone();
            let task_checksums = checksums.clone();
            let task_first_error = first_error.clone();
            let task_completed = completed.clone();
            let task_cancel = cancel.clone();

            join_set.spawn(async move {
                let result = task_uploader
                    .upload(&task_path, index, buffer.bytes(), &task_cancel)
                    .await;
                // 分片结束即归还缓冲区
                drop(buffer);

                match result {
                    Ok(md5) => {
                        if task_cancel.is_cancelled() {
                            debug!("[分片#{}] 任务已取消，丢弃结果", index);
                            return;
                        }
                        if task_checksums[index].set(md5).is_ok() {
                            task_completed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Err(UploadError::Cancelled) => {}
                    Err(e) => fail_job(&task_first_error, &task_cancel, e),
                }
            });

            // 回收已结束的任务
            while let Some(joined) = join_set.try_join_next() {
                if let Err(e) = joined {
                    fail_job(&first_error, cancel, UploadError::TaskPanicked(e.to_string()));
                }
            }
        }

        // 等待所有已派发的分片结束
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("分片任务异常: {}", e);
                fail_job(&first_error, cancel, UploadError::TaskPanicked(e.to_string()));
            }
        }

        job.completed_chunks = completed.load(Ordering::SeqCst);

        if let Some(e) = first_error.get() {
            return Err(e.clone());
        }
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let block_list = checksums
            .iter()
            .map(|md5| md5.get().cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or(UploadError::Cancelled)?;

        info!("[并发上传] 所有 {} 个分片上传完成", chunk_count);
        Ok(block_list)
    }

    /// 提交类请求（占位文件、合并、单请求上传）的重试
    ///
    /// 按 commit_decision 分类，可重试的错误在 creating 限流器放行后重试
    async fn commit_with_retries<T, F, Fut>(
        &self,
        op: &str,
        cancel: &CancellationToken,
        wrap: fn(PcsError) -> UploadError,
        mut call: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PcsError>>,
    {
        let rate = self.rate.get(RateCategory::Creating);
        let mut last_error: Option<PcsError> = None;

        for attempt in 1..=self.commit_max_attempts {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            if attempt > 1 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = rate.wait() => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = call() => result,
            };

            match result {
                Ok(value) => {
                    debug!("{} 成功 (第 {}/{} 次尝试)", op, attempt, self.commit_max_attempts);
                    return Ok(value);
                }
                Err(e) => {
                    if self.classifier.is_throttled(&e) {
                        rate.record_failure();
                    }
                    if self.classifier.commit_decision(&e) == RetryDecision::Fatal {
                        error!("{} 失败（不可重试）: {}", op, e);
                        return Err(wrap(e));
                    }
                    warn!(
                        "{} 失败 ({}/{}): {}",
                        op, attempt, self.commit_max_attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        error!("{} 失败，已达最大尝试次数 ({})", op, self.commit_max_attempts);
        Err(wrap(last_error.unwrap_or_else(|| {
            PcsError::Local(format!("{} 未发起任何请求", op))
        })))
    }
}

/// 已读满声明长度后，数据流是否还有剩余数据
///
/// 只多读一个字节；超出部分的实际长度不再统计
async fn has_trailing_bytes<R>(reader: &mut R) -> io::Result<bool>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let mut probe = [0u8; 1];
    Ok(reader.read(&mut probe).await? > 0)
}

/// 记录任务的第一个错误并取消整个任务
fn fail_job(first_error: &OnceLock<UploadError>, cancel: &CancellationToken, error: UploadError) {
    if first_error.set(error).is_ok() {
        cancel.cancel();
    }
}
