// Baidu PCS Upload Library
// 百度网盘 PCS 分片上传核心库

// 配置管理模块
pub mod config;

// 上传错误
pub mod error;

// 网盘文件系统
pub mod fs;

// 日志模块
pub mod logging;

// 网盘API模块
pub mod netdisk;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::UploadError;
pub use fs::{BaiduFs, FsError, RemoteObject};
pub use netdisk::{ErrorClassifier, PcsApi, PcsClient, PcsError, PcsErrorKind};
pub use uploader::{
    BufferPool, RateCategory, RateControlRegistry, UploadEngine, UploadJob, UploadJobStatus,
    UploadedObject,
};
