// 上传错误

use crate::netdisk::PcsError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// 上传任务的终止错误
///
/// 一个上传任务只会返回一个终止错误（并发分片中第一个失败的为准）
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("上传已取消")]
    Cancelled,

    #[error("分片 #{index} 被拒绝: {source}")]
    ChunkRejected {
        index: usize,
        #[source]
        source: PcsError,
    },

    #[error("分片 #{index} 上传失败，已尝试 {attempts} 次: {source}")]
    ChunkRetriesExhausted {
        index: usize,
        attempts: u32,
        #[source]
        source: PcsError,
    },

    #[error("创建占位文件失败: {0}")]
    Placeholder(#[source] PcsError),

    #[error("合并分片失败: {0}")]
    Merge(#[source] PcsError),

    #[error("单请求上传失败: {0}")]
    SingleUpload(#[source] PcsError),

    #[error("读取源数据失败: {0}")]
    Read(#[source] Arc<io::Error>),

    #[error("源数据长度不符: 期望 {expected} bytes, 实际 {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("分片任务异常: {0}")]
    TaskPanicked(String),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 底层 PCS 错误（如有）
    pub fn pcs_error(&self) -> Option<&PcsError> {
        match self {
            UploadError::ChunkRejected { source, .. }
            | UploadError::ChunkRetriesExhausted { source, .. } => Some(source),
            UploadError::Placeholder(source)
            | UploadError::Merge(source)
            | UploadError::SingleUpload(source) => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        UploadError::Read(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_source() {
        let err = UploadError::ChunkRetriesExhausted {
            index: 2,
            attempts: 5,
            source: PcsError::Network {
                status: Some(502),
                message: "HTTP 502 Bad Gateway".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "分片 #2 上传失败，已尝试 5 次: 网络错误: HTTP 502 Bad Gateway"
        );
        assert_eq!(err.pcs_error().and_then(|e| e.http_status()), Some(502));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: UploadError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, UploadError::Read(_)));
        assert!(!err.is_cancelled());
        assert!(UploadError::Cancelled.is_cancelled());
        assert!(err.pcs_error().is_none());
    }
}
