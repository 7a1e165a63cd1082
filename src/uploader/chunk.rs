// 分片上传器
//
// 把一个已填充的缓冲区作为临时分片上传到 PCS：
// - 成功：返回服务端给出的分片 MD5（合并时的分片标识）
// - 400/401/403/413：不可重试，立即失败
// - 其他状态码或传输错误：最多尝试 5 次，每次重发同一份缓冲数据
// - 取消：不再发起新的尝试，正在等待的响应直接放弃

use crate::error::UploadError;
use crate::netdisk::{ErrorClassifier, PcsApi, PcsError, RetryDecision};
use crate::uploader::rate_control::RateController;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个分片默认最大尝试次数
pub const DEFAULT_CHUNK_MAX_ATTEMPTS: u32 = 5;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算分片数量: ceil(size / chunk_size)
pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as usize
}

/// 第 `index` 个分片在源数据中的字节范围
pub fn chunk_range(index: usize, size: u64, chunk_size: u64) -> Range<u64> {
    let start = (index as u64).saturating_mul(chunk_size).min(size);
    let end = start.saturating_add(chunk_size).min(size);
    start..end
}

/// 计算指数退避延迟
///
/// retry=0: 100ms, retry=1: 200ms, retry=2: 400ms ... 最大 5000ms
pub fn calculate_backoff_delay(retry: u32) -> Duration {
    let delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// 分片上传器
///
/// 同一个上传任务的所有分片共享一个实例
pub struct ChunkUploader {
    api: Arc<dyn PcsApi>,
    classifier: Arc<ErrorClassifier>,
    /// 分片重试限流（uploading 类别）
    rate: Arc<RateController>,
    max_attempts: u32,
    verify_md5: bool,
}

impl ChunkUploader {
    pub fn new(
        api: Arc<dyn PcsApi>,
        classifier: Arc<ErrorClassifier>,
        rate: Arc<RateController>,
        max_attempts: u32,
        verify_md5: bool,
    ) -> Self {
        Self {
            api,
            classifier,
            rate,
            max_attempts: max_attempts.max(1),
            verify_md5,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 上传一个分片
    ///
    /// `data` 为缓冲区中的有效数据，重试期间调用方持有缓冲区不归还
    pub async fn upload(
        &self,
        remote_path: &str,
        index: usize,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let local_md5 = self
            .verify_md5
            .then(|| format!("{:x}", md5::compute(data)));

        debug!("[分片#{}] 开始上传 (大小: {} bytes)", index, data.len());

        let mut last_error: Option<PcsError> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                debug!("[分片#{}] 已取消，放弃第 {} 次尝试", index, attempt);
                return Err(UploadError::Cancelled);
            }

            if let Some(previous) = &last_error {
                let backoff = calculate_backoff_delay(attempt - 2);
                let throttled = self.classifier.is_throttled(previous);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = async {
                        tokio::time::sleep(backoff).await;
                        if throttled {
                            self.rate.wait().await;
                        }
                    } => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[分片#{}] 等待响应时被取消", index);
                    return Err(UploadError::Cancelled);
                }
                result = self.api.upload_tmp_chunk(remote_path, data) => result,
            };

            let error = match result {
                Ok(md5) => match &local_md5 {
                    Some(expected) if !md5.eq_ignore_ascii_case(expected) => {
                        PcsError::Decode(format!(
                            "分片 MD5 不一致: 本地 {}, 服务端 {}",
                            expected, md5
                        ))
                    }
                    _ => {
                        info!(
                            "[分片#{}] ✓ 上传成功 (第 {}/{} 次尝试)",
                            index, attempt, self.max_attempts
                        );
                        return Ok(md5);
                    }
                },
                Err(e) => e,
            };

            if self.classifier.chunk_decision(&error) == RetryDecision::Fatal {
                error!("[分片#{}] 上传失败（不可重试）: {}", index, error);
                return Err(UploadError::ChunkRejected {
                    index,
                    source: error,
                });
            }

            if self.classifier.is_throttled(&error) {
                self.rate.record_failure();
            }

            warn!(
                "[分片#{}] 上传失败 ({}/{}): {}",
                index, attempt, self.max_attempts, error
            );
            last_error = Some(error);
        }

        error!(
            "[分片#{}] 上传失败，已达最大尝试次数 ({})",
            index, self.max_attempts
        );

        Err(UploadError::ChunkRetriesExhausted {
            index,
            attempts: self.max_attempts,
            source: last_error.unwrap_or_else(|| PcsError::Local("未发起任何上传".to_string())),
        })
    }
}
