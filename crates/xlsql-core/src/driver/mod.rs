use std::{collections::HashMap, sync::Arc};

use crate::{DataSourceConfig, DataSourceKind};

pub use self::mysql::MySQLConnector;
pub use self::postgres::PostgresConnector;

mod mysql;
mod postgres;

/// 单元格值，只保留电子表格能原生表示的类型
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub type Row = Vec<Cell>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("连接失败: {0}")]
    Connect(String),
    #[error("查询失败: {0}")]
    Query(String),
    #[error("配置字段缺失: {0}")]
    MissingField(String),
    #[error("配置字段非法: {0}")]
    InvalidField(String),
    #[error("暂不支持的数据源类型: {}", .0.label())]
    Unsupported(DataSourceKind),
}

/// 某一类后端的连接器
pub trait Connector: Send + Sync {
    fn kind(&self) -> DataSourceKind;

    /// 单次尝试建立连接，不做重试
    fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Box<dyn ExportSession>, DriverError>;

    /// 测试连接是否可用，结束后立即释放
    fn check(
        &self,
        config: &DataSourceConfig,
    ) -> Result<(), DriverError> {
        self.open(config)?.close()
    }
}

/// 一次导出独占的数据库连接
pub trait ExportSession: Send {
    /// 执行 `SELECT COUNT(*) FROM (<sql>) AS subquery`
    fn count(
        &mut self,
        sql: &str,
    ) -> Result<u64, DriverError>;

    /// 以只进游标执行查询，每次最多取回 batch_size 行。
    /// 返回的流借用当前连接，drop 即关闭游标。
    fn stream(
        &mut self,
        sql: &str,
        batch_size: usize,
    ) -> Result<Box<dyn RowStream + '_>, DriverError>;

    fn close(self: Box<Self>) -> Result<(), DriverError>;
}

/// 只进、不可重放的分批行序列
pub trait RowStream {
    /// 读完后返回 None
    fn next_batch(&mut self) -> Result<Option<Vec<Row>>, DriverError>;
}

/// 数据源类型到连接器的映射
#[derive(Clone)]
pub struct DriverRegistry {
    connectors: HashMap<DataSourceKind, Arc<dyn Connector>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(MySQLConnector));
        registry.register(Arc::new(PostgresConnector));
        registry
    }
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// 同类型重复注册时覆盖旧的连接器
    pub fn register(
        &mut self,
        connector: Arc<dyn Connector>,
    ) -> &mut Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn supports(
        &self,
        kind: DataSourceKind,
    ) -> bool {
        self.connectors.contains_key(&kind)
    }

    pub fn connector(
        &self,
        kind: DataSourceKind,
    ) -> Result<Arc<dyn Connector>, DriverError> {
        self.connectors
            .get(&kind)
            .cloned()
            .ok_or(DriverError::Unsupported(kind))
    }

    pub fn open(
        &self,
        config: &DataSourceConfig,
    ) -> Result<Box<dyn ExportSession>, DriverError> {
        self.connector(config.kind)?.open(config)
    }

    pub fn check(
        &self,
        config: &DataSourceConfig,
    ) -> Result<(), DriverError> {
        self.connector(config.kind)?.check(config)
    }
}

/// 解析端口，空白、非数字或 0 时回退到默认值
pub fn parse_port(
    text: &str,
    default: u16,
) -> u16 {
    match text.trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => default,
    }
}

/// 统计查询，去掉用户 SQL 末尾的分号以便嵌套为子查询
pub fn count_sql(sql: &str) -> String {
    let inner = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT COUNT(*) FROM ({}) AS subquery", inner)
}

pub fn validate_sql(sql: &str) -> Result<(), DriverError> {
    if sql.trim().trim_end_matches(';').trim().is_empty() {
        return Err(DriverError::InvalidField("sql".into()));
    }
    Ok(())
}

fn require_field(
    value: &str,
    name: &str,
) -> Result<(), DriverError> {
    if value.trim().is_empty() {
        return Err(DriverError::MissingField(name.into()));
    }
    Ok(())
}
