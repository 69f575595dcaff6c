use std::io::{BufRead, stderr, stdin};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use chrono::Local;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_appender::{
    non_blocking,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt::layer, layer::SubscriberExt, util::SubscriberInitExt};

use xlsql_core::{ConfigStore, DriverRegistry, LocalStorage, SharedStorage, config_file, logs_dir};
use xlsql_task::{DEFAULT_BATCH_SIZE, EngineOptions, EventKind, ExportEngine, ExportEvent};

/// 将 SQL 查询结果导出为 xlsx
#[derive(Parser, Debug)]
#[command(name = "xlsql-task", version, about = "Export SQL query results to xlsx")]
struct CliArgs {
    /// 配置文件路径，默认 ~/.xlsql/config.json
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 执行导出脚本，进度以 JSON Lines 输出到 stdout；stdin 输入 cancel 取消
    Export {
        #[arg(short, long, value_name = "NAME")]
        script: String,
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
        #[arg(long, value_name = "ROWS", default_value_t = DEFAULT_BATCH_SIZE)]
        batch: usize,
    },
    /// 测试数据源连接
    Check {
        #[arg(short, long, value_name = "NAME")]
        source: String,
    },
    /// 列出已配置的数据源与脚本
    List,
}

/// 进度输出消息（写入 stdout 的 JSON Lines）
#[derive(Debug, Serialize)]
pub struct ProgressMessage {
    kind: MessageKind,
    time: String,
    data: serde_json::Value,
}

/// 消息类型
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TotalRows,
    Progress,
    Status,
    Error,
    Completed,
}

/// 初始化日志：stderr + 按天滚动的日志文件
fn init_logging() -> non_blocking::WorkerGuard {
    let log_level = if cfg!(debug_assertions) { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (file_layer, guard) = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("xlsql-task")
        .filename_suffix("log")
        .build(logs_dir())
    {
        Ok(appender) => {
            let (writer, guard) = non_blocking(appender);
            (Some(layer().with_writer(writer).with_ansi(false)), guard)
        }
        Err(e) => {
            eprintln!("无法创建日志文件: {}", e);
            let (_, guard) = non_blocking(std::io::sink());
            (None, guard)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer().with_writer(stderr))
        .with(file_layer)
        .init();

    guard
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let _log_guard = init_logging();
    tracing::info!("xlsql-task 启动，版本: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config_file.unwrap_or_else(config_file);
    let storage: SharedStorage = match LocalStorage::open(&config_path) {
        Ok(storage) => Arc::new(parking_lot::RwLock::new(storage)),
        Err(e) => {
            print_error(&format!("无法读取配置文件 {:?}: {}", config_path, e));
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Commands::Export { script, output, batch } => run_export(storage, script, output, batch),
        Commands::Check { source } => run_check(&storage, &source),
        Commands::List => run_list(&storage),
    }
}

fn run_export(
    storage: SharedStorage,
    script: String,
    output: PathBuf,
    batch: usize,
) -> ExitCode {
    let store: Arc<dyn ConfigStore> = storage;
    let options = EngineOptions { batch_size: batch };
    let (engine, events) = match ExportEngine::new(store, DriverRegistry::default(), options) {
        Ok(pair) => pair,
        Err(e) => {
            print_error(&format!("无法启动导出线程: {}", e));
            return ExitCode::FAILURE;
        }
    };

    // stdin 只用于接收取消指令，读到 EOF 时不做任何事
    let canceller = engine.canceller();
    let _ = thread::Builder::new().name("xlsql-stdin".into()).spawn(move || {
        for line in stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("cancel") => canceller.cancel(),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let printer = thread::spawn(move || {
        let mut terminal: Option<EventKind> = None;
        for event in events.iter() {
            print_event(&event);
            if event.kind.is_terminal() {
                terminal = Some(event.kind);
            }
        }
        terminal
    });

    let job = engine.submit(script, &output);
    engine.wait_idle();
    // drop 后工作线程退出，事件 channel 随之关闭
    drop(engine);

    match printer.join() {
        Ok(Some(EventKind::Finished(_))) => ExitCode::SUCCESS,
        Ok(Some(_)) => ExitCode::FAILURE,
        Ok(None) => {
            print_progress(ProgressMessage {
                kind: MessageKind::Status,
                time: now(),
                data: serde_json::json!({ "job": job.to_string(), "status": "cancelled" }),
            });
            ExitCode::FAILURE
        }
        Err(_) => {
            tracing::error!("事件输出线程异常退出");
            ExitCode::FAILURE
        }
    }
}

fn run_check(
    storage: &SharedStorage,
    name: &str,
) -> ExitCode {
    let Some(source) = storage.data_source(name) else {
        print_error(&format!("Data source '{}' not found", name));
        return ExitCode::FAILURE;
    };

    tracing::info!("测试连接: {}", source.endpoint());
    match DriverRegistry::default().check(&source) {
        Ok(()) => {
            print_completed(serde_json::json!({
                "source": source.name,
                "endpoint": source.endpoint(),
                "status": "ok",
            }));
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&format!("Failed to connect to database: {}", e));
            ExitCode::FAILURE
        }
    }
}

fn run_list(storage: &SharedStorage) -> ExitCode {
    let storage = storage.read();
    let sources: Vec<_> = storage
        .data_sources()
        .map(|ds| serde_json::json!({ "name": ds.name, "type": ds.kind.label(), "endpoint": ds.endpoint() }))
        .collect();
    let scripts: Vec<_> = storage
        .scripts()
        .map(|s| serde_json::json!({ "name": s.name, "fields": s.fields, "data_source": s.data_source_name }))
        .collect();

    print_completed(serde_json::json!({
        "config": storage.path(),
        "data_sources": sources,
        "scripts": scripts,
    }));
    ExitCode::SUCCESS
}

fn print_event(event: &ExportEvent) {
    let job = event.job.to_string();
    let (kind, data) = match &event.kind {
        EventKind::TotalRows(total) => (MessageKind::TotalRows, serde_json::json!({ "job": job, "total_rows": total })),
        EventKind::Progress(rows) => (MessageKind::Progress, serde_json::json!({ "job": job, "exported_rows": rows })),
        EventKind::Finished(message) => (
            MessageKind::Completed,
            serde_json::json!({ "job": job, "status": "success", "message": message }),
        ),
        EventKind::Failed(message) => (MessageKind::Error, serde_json::json!({ "job": job, "message": message })),
    };
    print_progress(ProgressMessage {
        kind,
        time: now(),
        data,
    });
}

fn now() -> String {
    Local::now().to_rfc3339()
}

pub fn print_error(message: &str) {
    tracing::error!("{}", message);
    print_progress(ProgressMessage {
        kind: MessageKind::Error,
        time: now(),
        data: serde_json::json!({ "message": message }),
    });
}

pub fn print_completed(data: serde_json::Value) {
    print_progress(ProgressMessage {
        kind: MessageKind::Completed,
        time: now(),
        data,
    });
}

pub fn print_progress(msg: ProgressMessage) {
    if let Ok(json) = serde_json::to_string(&msg) {
        println!("{}", json);
    }
}
