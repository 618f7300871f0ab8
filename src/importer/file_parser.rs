// ==========================================
// 批量迁移引擎 - CSV 记录源
// ==========================================
// 一个 CSV 文件对应一个目标模型
// 文件标识: "<文件名>@<内容 SHA-256 前 12 位>"，同一输入多次运行一致
// ==========================================

use crate::config::plan::MigrationPlan;
use crate::domain::record::{FieldValues, SourceIdentity, SourceRow};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::record_source_trait::RecordSource;
use csv::ReaderBuilder;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 文件标识中保留的摘要长度
const FILE_DIGEST_LEN: usize = 12;

/// 计算文件标识
pub fn file_identity(file_name: &str, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!("{}@{}", file_name, &digest[..FILE_DIGEST_LEN])
}

// ==========================================
// CsvRecordSource
// ==========================================
pub struct CsvRecordSource {
    path: PathBuf,
    model: String,
}

impl CsvRecordSource {
    pub fn new(path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model: model.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for CsvRecordSource {
    fn model(&self) -> &str {
        &self.model
    }

    fn rows(&self) -> ImportResult<Vec<SourceRow>> {
        let path = self.path.as_path();

        // 检查文件存在
        if !path.exists() {
            return Err(ImportError::FileNotFound(path.display().to_string()));
        }

        // 检查扩展名
        if let Some(ext) = path.extension() {
            if !ext.eq_ignore_ascii_case("csv") {
                return Err(ImportError::UnsupportedFormat(
                    ext.to_string_lossy().to_string(),
                ));
            }
        }

        let content = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let file_id = file_identity(&file_name, &content);

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true) // 允许行长度不一致
            .from_reader(content.as_slice());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let record = result?;
            // 空白行跳过但保留行号
            let row_number = index + 1;

            let mut fields = FieldValues::new();
            for (col_idx, value) in record.iter().enumerate() {
                if let Some(header) = headers.get(col_idx) {
                    if !header.is_empty() {
                        fields.insert(header.clone(), Value::String(value.to_string()));
                    }
                }
            }

            let blank = fields
                .values()
                .all(|v| v.as_str().map(|s| s.trim().is_empty()).unwrap_or(false));
            if blank {
                debug!(file = %file_name, row_number, "跳过空白行");
                continue;
            }

            rows.push(SourceRow::new(
                self.model.clone(),
                SourceIdentity::new(&file_id, row_number),
                row_number,
                fields,
            ));
        }

        info!(file = %file_name, model = %self.model, rows = rows.len(), "读取源文件完成");
        Ok(rows)
    }
}

/// 按计划读取所有启用模型的源文件（相对路径以 base_dir 为基准）
pub fn load_plan_sources(plan: &MigrationPlan, base_dir: &Path) -> ImportResult<Vec<SourceRow>> {
    let mut rows = Vec::new();
    for schema in plan.ordered_models() {
        let source = schema
            .source
            .as_ref()
            .ok_or_else(|| ImportError::MissingSource(schema.model.clone()))?;
        let path = base_dir.join(source);
        rows.extend(CsvRecordSource::new(path, schema.model.clone()).rows()?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_rows_numbered_and_identified() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "partners.csv", "name, phone\nAcme,555\n,\nBeta,777\n");

        let rows = CsvRecordSource::new(&path, "res.partner").rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[1].row_number, 3);
        assert_eq!(rows[0].fields.get("phone"), Some(&Value::String("555".into())));
        assert!(rows[0].identity.as_str().starts_with("partners.csv@"));
        assert!(rows[1].identity.as_str().ends_with("#3"));
    }

    #[test]
    fn test_identity_stable_across_reads() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "a.csv", "name\nAcme\n");
        let first = CsvRecordSource::new(&path, "m").rows().unwrap();
        let second = CsvRecordSource::new(&path, "m").rows().unwrap();
        assert_eq!(first[0].identity, second[0].identity);
    }

    #[test]
    fn test_file_identity_changes_with_content() {
        assert_ne!(file_identity("a.csv", b"x"), file_identity("a.csv", b"y"));
        assert_eq!(file_identity("a.csv", b"x").len(), "a.csv@".len() + FILE_DIGEST_LEN);
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        let dir = TempDir::new().unwrap();
        let missing = CsvRecordSource::new(dir.path().join("nope.csv"), "m").rows();
        assert!(matches!(missing, Err(ImportError::FileNotFound(_))));

        let path = write_csv(&dir, "data.xlsx", "name\n");
        let unsupported = CsvRecordSource::new(&path, "m").rows();
        assert!(matches!(unsupported, Err(ImportError::UnsupportedFormat(_))));
    }
}
