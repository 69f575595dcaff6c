use serde::{Deserialize, Deserializer, Serialize};

// 核心模块导出
pub mod driver;
pub mod paths;
pub mod storage;

// 重新导出 driver、storage 与 paths 类型
pub use driver::{
    Cell, Connector, DriverError, DriverRegistry, ExportSession, MySQLConnector, PostgresConnector, Row, RowStream,
    count_sql, parse_port,
};
pub use paths::{config_file, logs_dir, root_dir};
pub use storage::{ConfigStore, LocalStorage, SharedStorage, StorageError};

// ============================================================================
// Model Types
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourceKind {
    #[serde(rename = "MySQL")]
    MySQL,
    #[serde(rename = "PostgreSQL")]
    Postgres,
    #[serde(rename = "SQLite")]
    SQLite,
    #[serde(rename = "Oracle")]
    Oracle,
}

impl DataSourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DataSourceKind::MySQL => "MySQL",
            DataSourceKind::Postgres => "PostgreSQL",
            DataSourceKind::SQLite => "SQLite",
            DataSourceKind::Oracle => "Oracle",
        }
    }

    /// 各后端的默认端口，SQLite 没有网络端口
    pub fn default_port(&self) -> u16 {
        match self {
            DataSourceKind::MySQL => 3306,
            DataSourceKind::Postgres => 5432,
            DataSourceKind::SQLite => 0,
            DataSourceKind::Oracle => 1521,
        }
    }
}

/// 数据源配置，以 name 作为唯一标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
}

impl DataSourceConfig {
    pub fn new(
        name: impl Into<String>,
        kind: DataSourceKind,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            host: "127.0.0.1".into(),
            port: kind.default_port().to_string(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
        }
    }

    /// 解析后的端口，空白或非法时回退到后端默认端口
    pub fn port_or_default(&self) -> u16 {
        parse_port(&self.port, self.kind.default_port())
    }

    /// 不含密码的连接地址，用于日志与界面展示
    pub fn endpoint(&self) -> String {
        let scheme = match self.kind {
            DataSourceKind::MySQL => "mysql",
            DataSourceKind::Postgres => "postgres",
            DataSourceKind::SQLite => "sqlite",
            DataSourceKind::Oracle => "oracle",
        };
        let db = self.database.trim();
        if db.is_empty() {
            format!("{}://{}:{}", scheme, self.host, self.port_or_default())
        } else {
            format!("{}://{}:{}/{}", scheme, self.host, self.port_or_default(), db)
        }
    }
}

/// 导出脚本：表头字段 + 查询 SQL + 关联的数据源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportScript {
    pub name: String,
    #[serde(deserialize_with = "deserialize_fields")]
    pub fields: Vec<String>,
    pub sql: String,
    #[serde(default)]
    pub data_source_name: String,
}

impl ExportScript {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<String>,
        sql: impl Into<String>,
        data_source_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            sql: sql.into(),
            data_source_name: data_source_name.into(),
        }
    }
}

/// 拆分逗号分隔的字段列表，去除首尾空白并丢弃空项
pub fn split_fields(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(String::from)
        .collect()
}

/// 兼容旧格式：fields 既可以是数组，也可以是逗号分隔的字符串
fn deserialize_fields<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Fields {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match Fields::deserialize(deserializer)? {
        Fields::List(list) => list
            .into_iter()
            .map(|field| field.trim().to_string())
            .filter(|field| !field.is_empty())
            .collect(),
        Fields::Joined(text) => split_fields(&text),
    })
}
