#![allow(dead_code)]

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tempfile::TempDir;

use xlsql_core::{
    Cell, ConfigStore, Connector, DataSourceConfig, DataSourceKind, DriverError, DriverRegistry, ExportScript,
    ExportSession, LocalStorage, Row, RowStream,
};
use xlsql_task::{EventKind, ExportEvent, JobId};

type Hook = Box<dyn FnMut(usize) + Send>;

/// 进程内的假后端，记录连接与游标的打开/关闭顺序
#[derive(Default)]
pub struct FakeBackend {
    pub rows: u64,
    pub count: Option<u64>,
    pub refuse_connection: bool,
    pub fail_count: bool,
    pub fail_stream: bool,
    pub fail_on_batch: Option<usize>,
    pub hook: Mutex<Option<Hook>>,
    pub journal: Mutex<Vec<&'static str>>,
}

impl FakeBackend {
    pub fn with_rows(rows: u64) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// 每次 next_batch 开始时以批次序号调用
    pub fn set_hook(
        &self,
        hook: impl FnMut(usize) + Send + 'static,
    ) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    pub fn journal(&self) -> Vec<&'static str> {
        self.journal.lock().clone()
    }

    fn record(
        &self,
        entry: &'static str,
    ) {
        self.journal.lock().push(entry);
    }
}

struct FakeConnector(Arc<FakeBackend>);

impl Connector for FakeConnector {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::MySQL
    }

    fn open(
        &self,
        _config: &DataSourceConfig,
    ) -> Result<Box<dyn ExportSession>, DriverError> {
        if self.0.refuse_connection {
            return Err(DriverError::Connect("connection refused".into()));
        }
        self.0.record("connection:open");
        Ok(Box::new(FakeSession(self.0.clone())))
    }
}

struct FakeSession(Arc<FakeBackend>);

impl ExportSession for FakeSession {
    fn count(
        &mut self,
        _sql: &str,
    ) -> Result<u64, DriverError> {
        if self.0.fail_count {
            return Err(DriverError::Query("syntax error near 'FORM'".into()));
        }
        Ok(self.0.count.unwrap_or(self.0.rows))
    }

    fn stream(
        &mut self,
        _sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowStream + '_>, DriverError> {
        if self.0.fail_stream {
            return Err(DriverError::Query("permission denied".into()));
        }
        self.0.record("cursor:open");
        Ok(Box::new(FakeStream {
            backend: self.0.clone(),
            batch_size,
            next: 1,
            batches: 0,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.0.record("connection:close");
        Ok(())
    }
}

struct FakeStream {
    backend: Arc<FakeBackend>,
    batch_size: usize,
    next: u64,
    batches: usize,
}

impl RowStream for FakeStream {
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>, DriverError> {
        let index = self.batches;
        self.batches += 1;
        if let Some(hook) = self.backend.hook.lock().as_mut() {
            hook(index);
        }
        if self.backend.fail_on_batch == Some(index) {
            return Err(DriverError::Query("lost connection during query".into()));
        }

        let mut rows = vec![];
        while self.next <= self.backend.rows && rows.len() < self.batch_size {
            rows.push(vec![Cell::Int(self.next as i64), Cell::Text(format!("name-{}", self.next))]);
            self.next += 1;
        }
        if rows.is_empty() { Ok(None) } else { Ok(Some(rows)) }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.backend.record("cursor:close");
    }
}

pub fn registry(backend: &Arc<FakeBackend>) -> DriverRegistry {
    let mut registry = DriverRegistry::empty();
    registry.register(Arc::new(FakeConnector(backend.clone())));
    registry
}

/// 数据源 ds1 + 脚本 s1（SELECT id,name FROM customers）
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<LocalStorage>,
}

impl Fixture {
    pub fn new(fields: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = LocalStorage::open(dir.path().join("config.json")).unwrap();

        let mut ds = DataSourceConfig::new("ds1", DataSourceKind::MySQL);
        ds.host = "db.local".into();
        ds.username = "root".into();
        ds.database = "sales".into();
        storage.upsert_data_source(ds);
        storage.upsert_script(ExportScript::new(
            "s1",
            fields.iter().map(|f| f.to_string()).collect(),
            "SELECT id,name FROM customers",
            "ds1",
        ));
        storage.upsert_script(ExportScript::new(
            "orphan",
            vec!["id".into()],
            "SELECT id FROM customers",
            "ghost",
        ));

        Self {
            dir,
            store: Arc::new(storage),
        }
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        self.store.clone()
    }

    pub fn output(
        &self,
        name: &str,
    ) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn is_xlsx(path: &Path) -> bool {
    std::fs::read(path)
        .map(|data| data.starts_with(b"PK"))
        .unwrap_or(false)
}

/// 解压后的工作表、共享字符串与样式 XML
pub struct SheetXml {
    pub sheet: String,
    pub strings: String,
    pub styles: String,
}

impl SheetXml {
    pub fn read(path: &Path) -> Self {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = |name: &str| {
            let mut text = String::new();
            if let Ok(mut file) = archive.by_name(name) {
                file.read_to_string(&mut text).unwrap();
            }
            text
        };
        Self {
            sheet: entry("xl/worksheets/sheet1.xml"),
            strings: entry("xl/sharedStrings.xml"),
            styles: entry("xl/styles.xml"),
        }
    }

    /// 含表头的行数
    pub fn row_count(&self) -> usize {
        self.sheet.matches("<row ").count()
    }

    /// 文本可能内联在工作表中，也可能在共享字符串表中
    pub fn text_position(
        &self,
        text: &str,
    ) -> Option<usize> {
        let needle = format!("<t>{}</t>", text);
        self.sheet
            .find(&needle)
            .or_else(|| self.strings.find(&needle).map(|pos| self.sheet.len() + pos))
    }

    pub fn has_text(
        &self,
        text: &str,
    ) -> bool {
        self.text_position(text).is_some()
    }

    /// 表头按顺序写入，加粗并带 92D050 背景色
    pub fn assert_header(
        &self,
        fields: &[&str],
    ) {
        let positions: Vec<_> = fields
            .iter()
            .map(|field| self.text_position(field).unwrap_or_else(|| panic!("missing header {}", field)))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]), "header out of order");
        assert!(self.sheet.contains(r#"<c r="A1" s="1""#));
        assert!(self.styles.contains("<b/>"));
        assert!(self.styles.contains("92D050"));
    }
}

pub fn kinds_of(
    events: &[ExportEvent],
    job: JobId,
) -> Vec<EventKind> {
    events
        .iter()
        .filter(|event| event.job == job)
        .map(|event| event.kind.clone())
        .collect()
}

pub fn progress_values(kinds: &[EventKind]) -> Vec<u64> {
    kinds
        .iter()
        .filter_map(|kind| match kind {
            EventKind::Progress(rows) => Some(*rows),
            _ => None,
        })
        .collect()
}

pub fn drain(events: &Receiver<ExportEvent>) -> Vec<ExportEvent> {
    events.try_iter().collect()
}

pub const WAIT: Duration = Duration::from_secs(10);
