// 自适应限流控制器
//
// 每类接口（删除 / 创建 / 分片上传）一个控制器，进程内共享：
// - wait(): 按固定间隔放行，保证同类请求之间的最小间隔
// - record_failure(): 记录一次限流信号；短时间内失败过于密集时，
//   整个类别进入冷却，冷却期间所有 wait() 调用都会被挡住
//
// 失败记录的入队和淘汰在后台任务中完成，不拖慢失败请求本身

use crate::config::RateControlConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 限流类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateCategory {
    /// 删除文件 / 目录
    Deleting,
    /// 创建占位文件、合并分片
    Creating,
    /// 分片重试
    Uploading,
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateCategory::Deleting => "deleting",
            RateCategory::Creating => "creating",
            RateCategory::Uploading => "uploading",
        };
        f.write_str(name)
    }
}

/// 失败时间窗口
///
/// 固定容量的环形队列，满了之后新记录挤掉最旧的记录
#[derive(Debug)]
pub struct FailureWindow {
    entries: VecDeque<Instant>,
    capacity: usize,
}

impl FailureWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, at: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 最旧与最新记录之间的跨度
    pub fn span(&self) -> Option<Duration> {
        let oldest = self.entries.front()?;
        let newest = self.entries.back()?;
        Some(newest.saturating_duration_since(*oldest))
    }

    /// 从队首淘汰早于 `now - horizon` 的记录，返回淘汰数量
    pub fn evict_older_than(&mut self, now: Instant, horizon: Duration) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(*front) > horizon {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }
}

/// 单个类别的限流参数
#[derive(Debug, Clone)]
pub struct RateControlParams {
    /// 请求最小间隔
    pub interval: Duration,
    /// 冷却时长
    pub cooldown: Duration,
    /// 失败窗口容量
    pub window_capacity: usize,
    /// 触发冷却的失败次数
    pub failure_threshold: usize,
    /// 保留时长（以 interval 为单位）
    pub retention_intervals: u32,
}

impl RateControlParams {
    pub fn from_config(config: &RateControlConfig, category: RateCategory) -> Self {
        let interval_ms = match category {
            RateCategory::Deleting => config.deleting_interval_ms,
            RateCategory::Creating => config.creating_interval_ms,
            RateCategory::Uploading => config.uploading_interval_ms,
        };
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            cooldown: config.cooldown(),
            window_capacity: config.window_capacity,
            failure_threshold: config.failure_threshold,
            retention_intervals: config.retention_intervals,
        }
    }

    /// 失败记录保留时长
    pub fn horizon(&self) -> Duration {
        self.interval * self.retention_intervals
    }
}

/// 限流控制器
#[derive(Debug)]
pub struct RateController {
    category: RateCategory,
    params: RateControlParams,
    /// 失败窗口（入队、淘汰互斥）
    failures: Mutex<FailureWindow>,
    /// 冷却闸门：冷却时持有写锁，普通调用只取读锁
    gate: RwLock<()>,
    /// 间隔计时器（首次 wait 时创建）
    ticker: Mutex<Option<Interval>>,
    /// 是否处于冷却中
    cooling_down: AtomicBool,
    /// 累计冷却次数
    cooldowns: AtomicU64,
}

impl RateController {
    pub fn new(category: RateCategory, params: RateControlParams) -> Self {
        let capacity = params.window_capacity;
        Self {
            category,
            params,
            failures: Mutex::new(FailureWindow::new(capacity)),
            gate: RwLock::new(()),
            ticker: Mutex::new(None),
            cooling_down: AtomicBool::new(false),
            cooldowns: AtomicU64::new(0),
        }
    }

    pub fn category(&self) -> RateCategory {
        self.category
    }

    pub fn params(&self) -> &RateControlParams {
        &self.params
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooling_down.load(Ordering::SeqCst)
    }

    pub fn cooldown_count(&self) -> u64 {
        self.cooldowns.load(Ordering::SeqCst)
    }

    pub async fn window_len(&self) -> usize {
        self.failures.lock().await.len()
    }

    /// 等待放行
    ///
    /// 冷却期间阻塞到冷却结束，然后等待下一个计时周期
    pub async fn wait(&self) {
        drop(self.gate.read().await);

        let mut ticker = self.ticker.lock().await;
        let ticker = ticker.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(self.params.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        ticker.tick().await;
    }

    /// 记录一次限流失败
    ///
    /// 记录在后台任务中完成，返回该任务句柄
    pub fn record_failure(self: &Arc<Self>) -> JoinHandle<()> {
        let at = Instant::now();
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.register_failure(at).await })
    }

    async fn register_failure(&self, at: Instant) {
        let horizon = self.params.horizon();
        let mut failures = self.failures.lock().await;
        failures.push(at);

        debug!(
            "[限流:{}] 记录失败 ({}/{})",
            self.category,
            failures.len(),
            failures.capacity()
        );

        if failures.len() >= self.params.failure_threshold {
            let clustered = failures.span().is_some_and(|span| span <= horizon);
            if clustered {
                self.cooldown().await;
            }
        }

        let evicted = failures.evict_older_than(Instant::now(), horizon);
        if evicted > 0 {
            debug!("[限流:{}] 淘汰过期失败记录 {} 条", self.category, evicted);
        }
    }

    async fn cooldown(&self) {
        let _gate = self.gate.write().await;
        self.cooling_down.store(true, Ordering::SeqCst);
        self.cooldowns.fetch_add(1, Ordering::SeqCst);

        warn!(
            "[限流:{}] 失败过于密集，暂停 {:?}",
            self.category, self.params.cooldown
        );
        tokio::time::sleep(self.params.cooldown).await;

        self.cooling_down.store(false, Ordering::SeqCst);
        info!("[限流:{}] 冷却结束", self.category);
    }
}

/// 限流控制器注册表（进程内共享）
#[derive(Debug)]
pub struct RateControlRegistry {
    config: RateControlConfig,
    controllers: DashMap<RateCategory, Arc<RateController>>,
}

impl RateControlRegistry {
    pub fn new(config: RateControlConfig) -> Self {
        Self {
            config,
            controllers: DashMap::new(),
        }
    }

    /// 获取指定类别的控制器，不存在时创建
    pub fn get(&self, category: RateCategory) -> Arc<RateController> {
        self.controllers
            .entry(category)
            .or_insert_with(|| {
                let params = RateControlParams::from_config(&self.config, category);
                debug!("[限流:{}] 创建控制器: {:?}", category, params);
                Arc::new(RateController::new(category, params))
            })
            .clone()
    }
}

impl Default for RateControlRegistry {
    fn default() -> Self {
        Self::new(RateControlConfig::default())
    }
}
