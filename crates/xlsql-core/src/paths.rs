use std::{fs::create_dir_all, path::PathBuf};

/// 获取 xlsql 根目录（~/.xlsql）
///
/// Fallback: 如果 home_dir 失败，使用 ./.xlsql
pub fn root_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".xlsql"))
        .unwrap_or_else(|| PathBuf::from(".xlsql"))
}

/// 获取数据源与脚本配置文件路径（~/.xlsql/config.json）
pub fn config_file() -> PathBuf {
    root_dir().join("config.json")
}

/// 获取日志目录（~/.xlsql/logs）
pub fn logs_dir() -> PathBuf {
    let dir = root_dir().join("logs");
    let _ = create_dir_all(&dir);
    dir
}
