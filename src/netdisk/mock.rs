// 测试用的内存 PCS 实现
//
// 每类接口可注入一个处理函数，参数为调用序号（从 0 开始）和请求内容；
// 默认全部成功，分片返回数据的真实 MD5

use crate::netdisk::{FileMeta, PcsApi, PcsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type ChunkHandler = Box<dyn Fn(usize, &[u8]) -> Result<String, PcsError> + Send + Sync>;
type MergeHandler = Box<dyn Fn(usize, &[String]) -> Result<(), PcsError> + Send + Sync>;
type UploadHandler = Box<dyn Fn(usize, &[u8]) -> Result<(), PcsError> + Send + Sync>;
type RemoveHandler = Box<dyn Fn(usize, &[String]) -> Result<(), PcsError> + Send + Sync>;

pub struct MockPcs {
    chunk_handler: ChunkHandler,
    merge_handler: MergeHandler,
    upload_handler: UploadHandler,
    remove_handler: RemoveHandler,
    chunk_delay: Duration,

    pub chunk_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,

    /// 每次合并请求的 block_list
    pub merged: Mutex<Vec<Vec<String>>>,
    /// 每次整文件上传的 (路径, 长度)
    pub uploads: Mutex<Vec<(String, usize)>>,
    /// 被删除的路径
    pub removed: Mutex<Vec<String>>,
}

impl Default for MockPcs {
    fn default() -> Self {
        Self {
            chunk_handler: Box::new(|_, data| Ok(format!("{:x}", md5::compute(data)))),
            merge_handler: Box::new(|_, _| Ok(())),
            upload_handler: Box::new(|_, _| Ok(())),
            remove_handler: Box::new(|_, _| Ok(())),
            chunk_delay: Duration::ZERO,
            chunk_calls: AtomicUsize::new(0),
            merge_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            merged: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }
}

impl MockPcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &[u8]) -> Result<String, PcsError> + Send + Sync + 'static,
    {
        self.chunk_handler = Box::new(handler);
        self
    }

    pub fn on_merge<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &[String]) -> Result<(), PcsError> + Send + Sync + 'static,
    {
        self.merge_handler = Box::new(handler);
        self
    }

    pub fn on_upload<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &[u8]) -> Result<(), PcsError> + Send + Sync + 'static,
    {
        self.upload_handler = Box::new(handler);
        self
    }

    pub fn on_remove<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &[String]) -> Result<(), PcsError> + Send + Sync + 'static,
    {
        self.remove_handler = Box::new(handler);
        self
    }

    /// 每个分片请求在返回前等待的时长
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn merge_calls(&self) -> usize {
        self.merge_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn meta(path: &str, size: u64) -> FileMeta {
    FileMeta {
        path: path.to_string(),
        size,
        ..FileMeta::default()
    }
}

/// 简单的远端错误
pub fn remote_error(code: i64) -> PcsError {
    PcsError::Remote {
        code,
        status: Some(200),
        message: format!("remote error {}", code),
    }
}

/// 简单的 HTTP 状态错误
pub fn http_error(status: u16) -> PcsError {
    PcsError::Network {
        status: Some(status),
        message: format!("HTTP {}", status),
    }
}

#[async_trait]
impl PcsApi for MockPcs {
    async fn upload_tmp_chunk(&self, _remote_path: &str, data: &[u8]) -> Result<String, PcsError> {
        let call = self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        (self.chunk_handler)(call, data)
    }

    async fn create_super_file(
        &self,
        remote_path: &str,
        block_list: &[String],
    ) -> Result<FileMeta, PcsError> {
        let call = self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.merged.lock().push(block_list.to_vec());
        (self.merge_handler)(call, block_list)?;
        Ok(meta(remote_path, 0))
    }

    async fn upload_file(&self, remote_path: &str, data: &[u8]) -> Result<FileMeta, PcsError> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().push((remote_path.to_string(), data.len()));
        (self.upload_handler)(call, data)?;
        Ok(meta(remote_path, data.len() as u64))
    }

    async fn remove(&self, remote_paths: &[String]) -> Result<(), PcsError> {
        let call = self.remove_calls.fetch_add(1, Ordering::SeqCst);
        (self.remove_handler)(call, remote_paths)?;
        self.removed.lock().extend(remote_paths.iter().cloned());
        Ok(())
    }
}
