use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DataSourceConfig, ExportScript};

pub type SharedStorage = Arc<RwLock<LocalStorage>>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 导出引擎对配置层的只读访问
pub trait ConfigStore: Send + Sync {
    fn data_source(
        &self,
        name: &str,
    ) -> Option<DataSourceConfig>;

    fn script(
        &self,
        name: &str,
    ) -> Option<ExportScript>;
}

/// 配置文件的磁盘格式
#[derive(Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    scripts: Vec<ExportScript>,
}

/// 基于 JSON 文件的数据源与脚本存储，按 name 去重并保留插入顺序
pub struct LocalStorage {
    path: PathBuf,
    sources: IndexMap<String, DataSourceConfig>,
    scripts: IndexMap<String, ExportScript>,
}

impl LocalStorage {
    /// 文件不存在时返回空存储，首次 save 时创建
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let document: Document = if path.exists() {
            let data = fs::read(&path)?;
            serde_json::from_slice(&data)?
        } else {
            Document::default()
        };

        let sources = document
            .data_sources
            .into_iter()
            .map(|ds| (ds.name.clone(), ds))
            .collect();
        let scripts = document
            .scripts
            .into_iter()
            .map(|script| (script.name.clone(), script))
            .collect();

        tracing::debug!("加载配置文件: {:?}", path);
        Ok(Self { path, sources, scripts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_sources(&self) -> impl Iterator<Item = &DataSourceConfig> {
        self.sources.values()
    }

    pub fn scripts(&self) -> impl Iterator<Item = &ExportScript> {
        self.scripts.values()
    }

    pub fn upsert_data_source(
        &mut self,
        source: DataSourceConfig,
    ) {
        self.sources.insert(source.name.clone(), source);
    }

    pub fn remove_data_source(
        &mut self,
        name: &str,
    ) -> Option<DataSourceConfig> {
        self.sources.shift_remove(name)
    }

    pub fn upsert_script(
        &mut self,
        script: ExportScript,
    ) {
        self.scripts.insert(script.name.clone(), script);
    }

    pub fn remove_script(
        &mut self,
        name: &str,
    ) -> Option<ExportScript> {
        self.scripts.shift_remove(name)
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let document = Document {
            data_sources: self.sources.values().cloned().collect(),
            scripts: self.scripts.values().cloned().collect(),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(&document)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ConfigStore for LocalStorage {
    fn data_source(
        &self,
        name: &str,
    ) -> Option<DataSourceConfig> {
        self.sources.get(name).cloned()
    }

    fn script(
        &self,
        name: &str,
    ) -> Option<ExportScript> {
        self.scripts.get(name).cloned()
    }
}

impl ConfigStore for RwLock<LocalStorage> {
    fn data_source(
        &self,
        name: &str,
    ) -> Option<DataSourceConfig> {
        self.read().data_source(name)
    }

    fn script(
        &self,
        name: &str,
    ) -> Option<ExportScript> {
        self.read().script(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataSourceKind;

    #[test]
    fn missing_file_opens_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(tmp.path().join("config.json")).unwrap();
        assert_eq!(storage.data_sources().count(), 0);
        assert!(storage.script("s1").is_none());
    }

    #[test]
    fn save_and_reload_keeps_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut storage = LocalStorage::open(&path).unwrap();
        let mut ds = DataSourceConfig::new("ds1", DataSourceKind::MySQL);
        ds.database = "sales".into();
        storage.upsert_data_source(ds.clone());
        storage.upsert_data_source(DataSourceConfig::new("ds0", DataSourceKind::Postgres));
        storage.upsert_script(ExportScript::new(
            "s1",
            vec!["id".into(), "name".into()],
            "SELECT id,name FROM customers",
            "ds1",
        ));
        storage.save().unwrap();

        let reloaded = LocalStorage::open(&path).unwrap();
        let names: Vec<_> = reloaded.data_sources().map(|ds| ds.name.as_str()).collect();
        assert_eq!(names, vec!["ds1", "ds0"]);
        assert_eq!(reloaded.data_source("ds1"), Some(ds));
        assert_eq!(reloaded.script("s1").unwrap().fields, vec!["id", "name"]);
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut storage = LocalStorage::open(tmp.path().join("config.json")).unwrap();
        storage.upsert_script(ExportScript::new("s1", vec!["a".into()], "SELECT 1", "ds1"));
        storage.upsert_script(ExportScript::new("s1", vec!["b".into()], "SELECT 2", "ds1"));
        assert_eq!(storage.scripts().count(), 1);
        assert_eq!(storage.script("s1").unwrap().sql, "SELECT 2");

        assert!(storage.remove_script("s1").is_some());
        assert!(storage.remove_script("s1").is_none());
        assert!(storage.remove_data_source("missing").is_none());
    }

    #[test]
    fn reads_legacy_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "data_sources": [{"name": "ds1", "type": "MySQL", "host": "localhost", "port": "3306"}],
                "scripts": [{"name": "s1", "fields": "id,name", "sql": "SELECT id,name FROM customers", "data_source_name": "ds1"}]
            }"#,
        )
        .unwrap();

        let shared = RwLock::new(LocalStorage::open(&path).unwrap());
        let store: &dyn ConfigStore = &shared;
        assert_eq!(store.data_source("ds1").unwrap().username, "");
        assert_eq!(store.script("s1").unwrap().fields, vec!["id", "name"]);
    }
}
