use std::io;

use rust_xlsxwriter::XlsxError;
use xlsql_core::DriverError;

/// 导出失败的原因，Display 即为 failed 事件的消息
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },

    #[error("Failed to connect to database: {0}")]
    Connection(#[source] DriverError),

    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("Export failed: {0}")]
    Query(#[source] DriverError),

    #[error("Export failed: {0}")]
    Io(#[from] io::Error),

    #[error("Export failed: {0}")]
    Writer(#[from] XlsxError),
}

impl ExportError {
    pub fn script_not_found(name: &str) -> Self {
        Self::NotFound {
            what: "Script",
            name: name.into(),
        }
    }

    pub fn data_source_not_found(name: &str) -> Self {
        Self::NotFound {
            what: "Data source",
            name: name.into(),
        }
    }
}
