// 上传模块
//
// - buffer: 全局共享的上传缓冲池，限制同时在途的分片数
// - rate_control: 按接口类别的自适应限流
// - chunk: 单个分片的上传与重试
// - engine: 单个对象的上传状态机（占位文件 → 分片 → 合并）
// - task: 上传任务记录

pub mod buffer;
pub mod chunk;
pub mod engine;
pub mod rate_control;
pub mod task;

pub use buffer::{BufferPool, BufferSlot, PooledBuffer};
pub use chunk::{
    calculate_backoff_delay, chunk_count, chunk_range, ChunkUploader, DEFAULT_CHUNK_MAX_ATTEMPTS,
};
pub use engine::{UploadEngine, UploadedObject, DEFAULT_COMMIT_MAX_ATTEMPTS};
pub use rate_control::{
    FailureWindow, RateCategory, RateControlParams, RateControlRegistry, RateController,
};
pub use task::{UploadJob, UploadJobStatus};
