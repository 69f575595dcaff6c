use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use rust_xlsxwriter::{Color, ColNum, Format, RowNum, Workbook, XlsxError};
use xlsql_core::Cell;

use crate::ExportError;

pub const XLSX_EXTENSION: &str = "xlsx";

const SHEET_NAME: &str = "data";
const HEADER_BACKGROUND: u32 = 0x92D050;
// Excel 单元格文本上限
const MAX_TEXT_CHARS: usize = 32_767;

/// 缺少 .xlsx 后缀时补上
pub fn with_xlsx_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case(XLSX_EXTENSION) => path.to_path_buf(),
        _ => {
            let mut name = OsString::from(path.as_os_str());
            name.push(".");
            name.push(XLSX_EXTENSION);
            PathBuf::from(name)
        }
    }
}

/// 常量内存模式的 xlsx 写入器：第 0 行为表头，数据行按顺序追加
pub struct XlsxSheetWriter {
    workbook: Workbook,
    file: BufWriter<File>,
    path: PathBuf,
    rows: u64,
}

impl XlsxSheetWriter {
    /// 写好表头后立即创建输出文件，路径不可写时在读取任何数据前失败。
    /// 表头写入失败时不会留下空文件。
    pub fn create(
        path: &Path,
        fields: &[String],
    ) -> Result<Self, ExportError> {
        let mut workbook = Workbook::new();
        let header = Format::new()
            .set_bold()
            .set_font_color(Color::Black)
            .set_background_color(Color::RGB(HEADER_BACKGROUND));

        let worksheet = workbook.add_worksheet_with_constant_memory();
        worksheet.set_name(SHEET_NAME)?;
        for (idx, field) in fields.iter().enumerate() {
            worksheet.write_string_with_format(0, column(idx)?, field.as_str(), &header)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;

        tracing::debug!("创建输出文件: {:?}, 表头 {} 列", path, fields.len());
        Ok(Self {
            workbook,
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    /// 已写入的数据行数（不含表头）
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// 从第 0 列开始按位置写入一行，row 从 1 开始
    pub fn write_row(
        &mut self,
        row: u64,
        values: &[Cell],
    ) -> Result<(), ExportError> {
        let row = RowNum::try_from(row).map_err(|_| XlsxError::RowColumnLimitError)?;
        let worksheet = self.workbook.worksheet_from_index(0)?;

        for (idx, value) in values.iter().enumerate() {
            let col = column(idx)?;
            match value {
                Cell::Null => {}
                Cell::Bool(flag) => {
                    worksheet.write_boolean(row, col, *flag)?;
                }
                Cell::Int(int) => {
                    worksheet.write_number(row, col, *int as f64)?;
                }
                Cell::Float(float) => {
                    worksheet.write_number(row, col, *float)?;
                }
                Cell::Text(text) => {
                    worksheet.write_string(row, col, clip_text(text))?;
                }
            }
        }
        self.rows += 1;
        Ok(())
    }

    /// 写出工作簿并关闭文件，消耗 self 保证只调用一次
    pub fn finalize(mut self) -> Result<PathBuf, ExportError> {
        self.workbook.save_to_writer(&mut self.file)?;
        self.file.flush()?;
        tracing::debug!("输出文件已写入: {:?}, 数据行 {}", self.path, self.rows);
        Ok(self.path)
    }
}

fn column(idx: usize) -> Result<ColNum, XlsxError> {
    ColNum::try_from(idx).map_err(|_| XlsxError::RowColumnLimitError)
}

fn clip_text(text: &str) -> &str {
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((end, _)) => {
            tracing::warn!("单元格文本超过 {} 字符，已截断", MAX_TEXT_CHARS);
            &text[..end]
        }
        None => text,
    }
}
