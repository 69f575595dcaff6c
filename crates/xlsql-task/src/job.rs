use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use crossbeam_channel::Sender;
use uuid::Uuid;
use xlsql_core::{ConfigStore, DriverRegistry, ExportScript, ExportSession, RowStream};

use crate::{EventKind, ExportError, ExportEvent, JobId, XlsxSheetWriter, with_xlsx_extension};

/// 导出任务的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Connecting,
    Counting,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

/// 协作式取消标志，只负责置位，由任务在安全点检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed { rows: u64, message: String },
    Cancelled { rows: u64 },
    Failed(ExportError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed { .. } => JobState::Completed,
            JobOutcome::Cancelled { .. } => JobState::Cancelled,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }
}

enum Flow {
    Completed(u64),
    Cancelled(u64),
}

/// 一次导出：连接 → 统计 → 流式读取 → 写入 → 收尾
pub struct ExportJob {
    id: JobId,
    script_name: String,
    output: PathBuf,
    batch_size: usize,
    cancel: CancelToken,
    rows: Arc<AtomicU64>,
    state: JobState,
}

impl ExportJob {
    pub fn new(
        script_name: impl Into<String>,
        output: impl AsRef<Path>,
        batch_size: usize,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), script_name, output, batch_size)
    }

    pub fn with_id(
        id: JobId,
        script_name: impl Into<String>,
        output: impl AsRef<Path>,
        batch_size: usize,
    ) -> Self {
        Self {
            id,
            script_name: script_name.into(),
            output: with_xlsx_extension(output.as_ref()),
            batch_size: batch_size.max(1),
            cancel: CancelToken::new(),
            rows: Arc::new(AtomicU64::new(0)),
            state: JobState::Created,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 已写入行数计数器，可在其他线程读取
    pub fn rows_counter(&self) -> Arc<AtomicU64> {
        self.rows.clone()
    }

    /// 在当前线程执行任务。所有错误都在这里转换为 failed 事件，
    /// 取消时不发出结束事件。
    pub fn run(
        mut self,
        store: &dyn ConfigStore,
        registry: &DriverRegistry,
        events: &Sender<ExportEvent>,
    ) -> JobOutcome {
        let started = Instant::now();
        tracing::info!(job = %self.id, "开始导出: script={}, output={:?}", self.script_name, self.output);

        let outcome = match self.execute(store, registry, events) {
            Ok(Flow::Completed(rows)) => {
                let message = if rows > 0 {
                    format!("Exported {} rows to {}", rows, self.output.display())
                } else {
                    "No data to export".to_string()
                };
                tracing::info!(
                    job = %self.id,
                    "导出完成，共 {} 行，耗时 {:.1} 秒",
                    rows,
                    started.elapsed().as_secs_f64()
                );
                self.emit(events, EventKind::Finished(message.clone()));
                JobOutcome::Completed { rows, message }
            }
            Ok(Flow::Cancelled(rows)) => {
                tracing::info!(job = %self.id, "导出已取消，已写入 {} 行", rows);
                JobOutcome::Cancelled { rows }
            }
            Err(err) if self.cancel.is_cancelled() => {
                let rows = self.rows.load(Ordering::Acquire);
                tracing::info!(job = %self.id, "导出已取消，忽略取消后的错误: {}", err);
                JobOutcome::Cancelled { rows }
            }
            Err(err) => {
                tracing::error!(job = %self.id, "导出失败: {}", err);
                self.emit(events, EventKind::Failed(err.to_string()));
                JobOutcome::Failed(err)
            }
        };

        self.transition(outcome.state());
        outcome
    }

    fn execute(
        &mut self,
        store: &dyn ConfigStore,
        registry: &DriverRegistry,
        events: &Sender<ExportEvent>,
    ) -> Result<Flow, ExportError> {
        self.transition(JobState::Connecting);
        let script = store
            .script(&self.script_name)
            .ok_or_else(|| ExportError::script_not_found(&self.script_name))?;
        let source = store
            .data_source(&script.data_source_name)
            .ok_or_else(|| ExportError::data_source_not_found(&script.data_source_name))?;

        tracing::info!(job = %self.id, "连接数据源: {} ({})", source.name, source.endpoint());
        let mut session = registry.open(&source).map_err(ExportError::Connection)?;

        let result = self.export(session.as_mut(), &script, events);

        match session.close() {
            Ok(()) => tracing::debug!(job = %self.id, "数据库连接已关闭"),
            Err(err) => tracing::warn!(job = %self.id, "关闭数据库连接失败: {}", err),
        }
        result
    }

    fn export(
        &mut self,
        session: &mut dyn ExportSession,
        script: &ExportScript,
        events: &Sender<ExportEvent>,
    ) -> Result<Flow, ExportError> {
        self.transition(JobState::Counting);
        let total = session.count(&script.sql).map_err(ExportError::Query)?;
        tracing::info!(job = %self.id, "总行数: {}", total);
        self.emit(events, EventKind::TotalRows(total));

        if script.fields.is_empty() {
            return Err(ExportError::InvalidConfiguration(format!(
                "No fields specified in script '{}'",
                script.name
            )));
        }
        if self.cancel.is_cancelled() {
            return Ok(Flow::Cancelled(0));
        }

        self.transition(JobState::Streaming);
        let mut writer = XlsxSheetWriter::create(&self.output, &script.fields)?;

        let mut stream = match session.stream(&script.sql, self.batch_size) {
            Ok(stream) => stream,
            Err(err) => {
                self.transition(JobState::Finalizing);
                if let Err(close_err) = writer.finalize() {
                    tracing::warn!(job = %self.id, "关闭输出文件失败: {}", close_err);
                }
                return Err(ExportError::Query(err));
            }
        };

        let pumped = self.pump(stream.as_mut(), &mut writer, events);

        // 依次释放：输出文件 → 游标，连接由调用方关闭
        self.transition(JobState::Finalizing);
        let finalized = writer.finalize();
        drop(stream);
        tracing::debug!(job = %self.id, "游标已关闭");

        let flow = pumped?;
        finalized?;
        Ok(flow)
    }

    fn pump(
        &self,
        stream: &mut dyn RowStream,
        writer: &mut XlsxSheetWriter,
        events: &Sender<ExportEvent>,
    ) -> Result<Flow, ExportError> {
        let mut written = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled(written));
            }
            let Some(batch) = stream.next_batch().map_err(ExportError::Query)? else {
                break;
            };
            tracing::debug!(job = %self.id, "读取 {} 行，累计 {}", batch.len(), written);

            for row in batch {
                if self.cancel.is_cancelled() {
                    return Ok(Flow::Cancelled(written));
                }
                writer.write_row(written + 1, &row)?;
                written += 1;
                self.rows.store(written, Ordering::Release);
                self.emit(events, EventKind::Progress(written));
            }
        }
        Ok(Flow::Completed(written))
    }

    fn transition(
        &mut self,
        next: JobState,
    ) {
        tracing::debug!(job = %self.id, "状态: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn emit(
        &self,
        events: &Sender<ExportEvent>,
        kind: EventKind,
    ) {
        // 接收端已关闭时丢弃事件，任务照常收尾
        let _ = events.send(ExportEvent { job: self.id, kind });
    }
}
