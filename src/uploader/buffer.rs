// 上传缓冲池
//
// 固定数量的定长缓冲区，在进程（或一个 BaiduFs 实例）内所有上传任务之间共享：
// - 池容量即分片上传的全局并发上限，没有缓冲区就不能上传分片
// - 读取源数据前必须先借到缓冲区，借不到就阻塞，这是唯一的背压手段
// - 借出的缓冲区由 PooledBuffer 持有，无论成功、失败还是取消，Drop 时都会归还

use crate::config::UploadConfig;
use parking_lot::Mutex;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 缓冲区
///
/// 容量在创建后固定不变，`len` 记录最近一次填充的有效字节数
#[derive(Debug)]
pub struct BufferSlot {
    /// 槽位ID
    id: usize,
    /// 数据区
    data: Box<[u8]>,
    /// 有效数据长度
    len: usize,
}

impl BufferSlot {
    fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 有效数据
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// 从输入流读取最多 `limit` 字节（不超过容量）
    ///
    /// 读到流末尾时允许短读，返回实际读取的字节数；
    /// 其他读取错误会清空有效数据并返回错误
    pub async fn fill<R>(&mut self, reader: &mut R, limit: usize) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let limit = limit.min(self.data.len());
        self.len = 0;

        while self.len < limit {
            match reader.read(&mut self.data[self.len..limit]).await {
                Ok(0) => break,
                Ok(n) => self.len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.len = 0;
                    return Err(e);
                }
            }
        }

        Ok(self.len)
    }

    fn reset(&mut self) {
        self.len = 0;
    }

    /// 不占内存的空槽位，仅用于 PooledBuffer 归还时占位
    fn detached() -> Self {
        Self {
            id: usize::MAX,
            data: Box::default(),
            len: 0,
        }
    }
}

/// 上传缓冲池
#[derive(Debug)]
pub struct BufferPool {
    /// 空闲缓冲区
    free: Mutex<Vec<BufferSlot>>,
    /// 可用信号，许可数始终等于空闲缓冲区数
    available: Arc<Semaphore>,
    /// 池容量
    size: usize,
    /// 单个缓冲区容量（即分片大小）
    slot_capacity: usize,
    /// 当前借出数
    in_use: AtomicUsize,
    /// 历史最大借出数
    peak_in_use: AtomicUsize,
}

impl BufferPool {
    /// 创建缓冲池，所有缓冲区在此一次性分配
    pub fn new(size: usize, slot_capacity: usize) -> Arc<Self> {
        let size = size.max(1);
        let free = (0..size)
            .map(|id| BufferSlot::new(id, slot_capacity))
            .collect();

        info!(
            "创建上传缓冲池: 槽位数={}, 单槽容量={} bytes, 总内存={} bytes",
            size,
            slot_capacity,
            size * slot_capacity
        );

        Arc::new(Self {
            free: Mutex::new(free),
            available: Arc::new(Semaphore::new(size)),
            size,
            slot_capacity,
            in_use: AtomicUsize::new(0),
            peak_in_use: AtomicUsize::new(0),
        })
    }

    /// 按上传配置创建缓冲池
    pub fn from_config(config: &UploadConfig) -> Arc<Self> {
        Self::new(config.pool_size(), config.upload_chunk_size as usize)
    }

    /// 池容量
    pub fn size(&self) -> usize {
        self.size
    }

    /// 单个缓冲区容量
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// 当前借出数
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// 历史最大借出数
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    /// 当前空闲数
    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// 借出一个缓冲区
    ///
    /// 池已耗尽时阻塞，直到有缓冲区归还；取消令牌触发时返回 None
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Option<PooledBuffer> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = self.available.clone().acquire_owned() => permit.ok()?,
        };
        self.checkout(permit)
    }

    /// 非阻塞借出
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        let permit = self.available.clone().try_acquire_owned().ok()?;
        self.checkout(permit)
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<PooledBuffer> {
        let slot = self.free.lock().pop()?;

        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(in_use, Ordering::SeqCst);
        debug!("借出缓冲区 #{} (借出 {}/{})", slot.id, in_use, self.size);

        Some(PooledBuffer {
            slot,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// 归还缓冲区（许可随 PooledBuffer 一起释放）
    fn release(&self, mut slot: BufferSlot) {
        slot.reset();
        let id = slot.id;
        self.free.lock().push(slot);
        let in_use = self.in_use.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("归还缓冲区 #{} (借出 {}/{})", id, in_use, self.size);
    }
}

/// 借出的缓冲区
///
/// Drop 时先把缓冲区放回空闲列表，再释放许可，保证等待者拿到许可时一定有缓冲区可用
#[derive(Debug)]
pub struct PooledBuffer {
    slot: BufferSlot,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = BufferSlot;

    fn deref(&self) -> &BufferSlot {
        &self.slot
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BufferSlot {
        &mut self.slot
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let slot = std::mem::replace(&mut self.slot, BufferSlot::detached());
        self.pool.release(slot);
    }
}
