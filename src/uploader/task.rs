// 上传任务记录
//
// 每个对象的一次写入对应一个 UploadJob，随状态机流转更新，
// 写入结束时连同结果一起返回给调用方

use crate::uploader::chunk::chunk_count;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 上传任务状态
///
/// Init → CreatingPlaceholder → Uploading → Merging → Completed，
/// Cancelled / Failed 可从任意非终止状态进入
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadJobStatus {
    /// 初始化
    Init,
    /// 创建占位文件中
    CreatingPlaceholder,
    /// 分片上传中
    Uploading,
    /// 合并分片中
    Merging,
    /// 已完成
    Completed,
    /// 已取消
    Cancelled,
    /// 失败
    Failed,
}

impl UploadJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadJobStatus::Completed | UploadJobStatus::Cancelled | UploadJobStatus::Failed
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    /// 任务ID
    pub id: String,
    /// 网盘目标路径
    pub remote_path: String,
    /// 文件大小
    pub total_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 总分片数
    pub chunk_count: usize,
    /// 已完成分片数
    pub completed_chunks: usize,
    /// 任务状态
    pub status: UploadJobStatus,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadJob {
    /// 创建新的上传任务
    pub fn new(remote_path: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_path: remote_path.into(),
            total_size,
            chunk_size,
            chunk_count: chunk_count(total_size, chunk_size),
            completed_chunks: 0,
            status: UploadJobStatus::Init,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 是否走单请求上传（空文件或不超过一个分片）
    pub fn is_single_request(&self) -> bool {
        self.chunk_count <= 1
    }

    /// 分片进度百分比
    pub fn progress(&self) -> f64 {
        if self.chunk_count == 0 {
            return if self.status == UploadJobStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.completed_chunks as f64 / self.chunk_count as f64) * 100.0
    }

    fn touch_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为创建占位文件中
    pub fn mark_creating_placeholder(&mut self) {
        self.status = UploadJobStatus::CreatingPlaceholder;
        self.touch_started();
    }

    /// 标记为分片上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadJobStatus::Uploading;
        self.touch_started();
    }

    /// 标记为合并中
    pub fn mark_merging(&mut self) {
        self.status = UploadJobStatus::Merging;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = UploadJobStatus::Completed;
        self.completed_chunks = self.chunk_count;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = UploadJobStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadJobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}
