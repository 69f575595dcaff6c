use std::{
    io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xlsql_core::{ConfigStore, DriverRegistry};

use crate::{CancelToken, EventKind, ExportEvent, ExportJob, JobId, with_xlsx_extension};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// 每次从游标取回的行数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

struct ExportRequest {
    id: JobId,
    script_name: String,
    output: PathBuf,
    generation: u64,
}

struct Running {
    id: JobId,
    cancel: CancelToken,
    rows: Arc<AtomicU64>,
}

#[derive(Default)]
struct Slot {
    running: Option<Running>,
    queued: usize,
}

impl Slot {
    fn busy(&self) -> bool {
        self.running.is_some() || self.queued > 0
    }
}

/// 工作线程与调用方共享的状态。
/// generation 只在持有 slot 锁时修改。
#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    idle: Condvar,
    generation: AtomicU64,
}

/// 取消句柄，可跨线程持有，不影响引擎的生命周期
#[derive(Clone)]
pub struct EngineCanceller {
    shared: Arc<Shared>,
    backlog: Receiver<ExportRequest>,
}

impl EngineCanceller {
    /// 取消正在运行的任务并清空排队中的请求，可重复调用
    pub fn cancel(&self) {
        let mut slot = self.shared.slot.lock();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let dropped = self.backlog.try_iter().count();
        slot.queued = slot.queued.saturating_sub(dropped);
        if dropped > 0 {
            tracing::info!("已清除 {} 个排队中的导出请求", dropped);
        }

        if let Some(running) = &slot.running {
            if !running.cancel.is_cancelled() {
                tracing::info!(job = %running.id, "请求取消导出");
            }
            running.cancel.cancel();
        }
        self.shared.idle.notify_all();
    }
}

/// 单工作线程的导出引擎：同一时刻至多运行一个任务，其余按提交顺序排队。
/// 事件通过 channel 交给调用方，同一任务内保持发出顺序。
pub struct ExportEngine {
    queue: Option<Sender<ExportRequest>>,
    canceller: EngineCanceller,
    worker: Option<JoinHandle<()>>,
}

impl ExportEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: DriverRegistry,
        options: EngineOptions,
    ) -> io::Result<(Self, Receiver<ExportEvent>)> {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<ExportRequest>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::default());

        let worker = {
            let shared = shared.clone();
            let queue_rx = queue_rx.clone();
            let batch_size = options.batch_size;
            thread::Builder::new()
                .name("xlsql-export".into())
                .spawn(move || work(shared, queue_rx, store, registry, batch_size, event_tx))?
        };

        let engine = Self {
            queue: Some(queue_tx),
            canceller: EngineCanceller {
                shared,
                backlog: queue_rx,
            },
            worker: Some(worker),
        };
        Ok((engine, event_rx))
    }

    /// 提交导出请求并立即返回任务 ID
    pub fn submit(
        &self,
        script_name: impl Into<String>,
        output: impl AsRef<Path>,
    ) -> JobId {
        let shared = &self.canceller.shared;
        let id = Uuid::new_v4();
        let script_name = script_name.into();
        let output = with_xlsx_extension(output.as_ref());

        let mut slot = shared.slot.lock();
        let Some(queue) = &self.queue else {
            tracing::warn!(job = %id, "导出引擎已关闭，丢弃请求");
            return id;
        };
        tracing::info!(job = %id, "提交导出请求: script={}, output={:?}", script_name, output);
        let request = ExportRequest {
            id,
            script_name,
            output,
            generation: shared.generation.load(Ordering::SeqCst),
        };
        if queue.send(request).is_ok() {
            slot.queued += 1;
        } else {
            tracing::warn!(job = %id, "导出线程已退出，丢弃请求");
        }
        id
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> EngineCanceller {
        self.canceller.clone()
    }

    /// 正在运行的任务及其已写入行数
    pub fn current_progress(&self) -> Option<(JobId, u64)> {
        let slot = self.canceller.shared.slot.lock();
        slot.running
            .as_ref()
            .map(|running| (running.id, running.rows.load(Ordering::Acquire)))
    }

    pub fn is_busy(&self) -> bool {
        self.canceller.shared.slot.lock().busy()
    }

    /// 阻塞直到没有运行中或排队中的任务
    pub fn wait_idle(&self) {
        let shared = &self.canceller.shared;
        let mut slot = shared.slot.lock();
        while slot.busy() {
            shared.idle.wait(&mut slot);
        }
    }

    /// 超时返回 false
    pub fn wait_idle_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let shared = &self.canceller.shared;
        let deadline = Instant::now() + timeout;
        let mut slot = shared.slot.lock();
        while slot.busy() {
            if shared.idle.wait_until(&mut slot, deadline).timed_out() {
                return !slot.busy();
            }
        }
        true
    }
}

impl Drop for ExportEngine {
    fn drop(&mut self) {
        self.cancel();
        drop(self.queue.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("导出线程异常退出");
            }
        }
    }
}

fn work(
    shared: Arc<Shared>,
    queue: Receiver<ExportRequest>,
    store: Arc<dyn ConfigStore>,
    registry: DriverRegistry,
    batch_size: usize,
    events: Sender<ExportEvent>,
) {
    tracing::debug!("导出线程启动");
    for request in queue.iter() {
        let job = {
            let mut slot = shared.slot.lock();
            slot.queued = slot.queued.saturating_sub(1);
            if request.generation != shared.generation.load(Ordering::SeqCst) {
                tracing::debug!(job = %request.id, "请求已被取消，跳过");
                shared.idle.notify_all();
                continue;
            }

            let job = ExportJob::with_id(request.id, request.script_name, request.output, batch_size);
            slot.running = Some(Running {
                id: job.id(),
                cancel: job.cancel_token(),
                rows: job.rows_counter(),
            });
            job
        };

        let id = job.id();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(store.as_ref(), &registry, &events)));
        match outcome {
            Ok(outcome) => tracing::debug!(job = %id, "任务结束: {:?}", outcome.state()),
            Err(_) => {
                tracing::error!(job = %id, "导出任务 panic");
                let _ = events.send(ExportEvent {
                    job: id,
                    kind: EventKind::Failed("Export failed: internal error".into()),
                });
            }
        }

        let mut slot = shared.slot.lock();
        slot.running = None;
        shared.idle.notify_all();
    }
    tracing::debug!("导出线程退出");
}
