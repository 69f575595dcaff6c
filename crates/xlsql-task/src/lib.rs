//! 将 SQL 查询结果流式导出为 xlsx：单工作线程调度、协作式取消、
//! 通过 channel 向调用方回传进度。

pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod writer;

pub use engine::{DEFAULT_BATCH_SIZE, EngineCanceller, EngineOptions, ExportEngine};
pub use error::ExportError;
pub use event::{EventKind, ExportEvent, JobId};
pub use job::{CancelToken, ExportJob, JobOutcome, JobState};
pub use writer::{XLSX_EXTENSION, XlsxSheetWriter, with_xlsx_extension};
