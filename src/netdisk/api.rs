// PCS 接口抽象
//
// 上传核心只依赖这四个操作，真实实现见 PcsClient，测试中使用内存实现

use crate::netdisk::{FileMeta, PcsError};
use async_trait::async_trait;

#[async_trait]
pub trait PcsApi: Send + Sync {
    /// 上传临时分片，返回服务端分片 MD5
    ///
    /// `remote_path` 仅用于日志，临时分片不落在目标路径上
    async fn upload_tmp_chunk(&self, remote_path: &str, data: &[u8]) -> Result<String, PcsError>;

    /// 按顺序合并临时分片为目标文件
    async fn create_super_file(
        &self,
        remote_path: &str,
        block_list: &[String],
    ) -> Result<FileMeta, PcsError>;

    /// 单请求上传整个文件（空占位文件、单分片文件）
    async fn upload_file(&self, remote_path: &str, data: &[u8]) -> Result<FileMeta, PcsError>;

    /// 删除文件或目录树
    async fn remove(&self, remote_paths: &[String]) -> Result<(), PcsError>;
}
