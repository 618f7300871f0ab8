// ==========================================
// 批量迁移引擎 - 文件账本
// ==========================================
// 目录布局: <root>/<run_id>/
//   ledger.jsonl       每行一条 LedgerEntry，追加后 fsync
//   ledger.csv         同列 CSV 镜像（可关闭）
//   checkpoints.jsonl  批次完成标记
//   run.json           运行元数据（临时文件 + rename 原子替换）
// 崩溃留下的半行只可能在文件末尾，读取时忽略
// ==========================================

use crate::domain::ledger::{BatchCheckpoint, LedgerEntry, MigrationRun};
use crate::repository::error::{LedgerError, LedgerResult};
use crate::repository::ledger_repo::AuditLedger;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

const LEDGER_FILE: &str = "ledger.jsonl";
const LEDGER_CSV_FILE: &str = "ledger.csv";
const CHECKPOINT_FILE: &str = "checkpoints.jsonl";
const RUN_FILE: &str = "run.json";

const CSV_HEADER: &[&str] = &[
    "recorded_at",
    "run_id",
    "model",
    "source_identity",
    "row_number",
    "dedupe_key",
    "state",
    "action",
    "remote_id",
    "error_message",
    "batch_seq",
];

pub struct FileLedger {
    root: PathBuf,
    csv_mirror: bool,
    write_lock: Mutex<()>,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>, csv_mirror: bool) -> LedgerResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            csv_mirror,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 运行目录（run_id 只允许字母数字与 - _）
    pub fn run_dir(&self, run_id: &str) -> LedgerResult<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(LedgerError::FieldValueError {
                field: "run_id".to_string(),
                message: format!("非法运行 ID: {}", run_id),
            });
        }
        Ok(self.root.join(run_id))
    }

    fn guard(&self) -> LedgerResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| LedgerError::LockError(e.to_string()))
    }

    fn append_line<T: Serialize>(&self, path: &Path, item: &T) -> LedgerResult<()> {
        let mut line = serde_json::to_string(item)?;
        line.push('\n');

        truncate_torn_tail(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn append_csv(&self, path: &Path, entry: &LedgerEntry) -> LedgerResult<()> {
        truncate_torn_tail(path)?;
        let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if is_new {
            writer.write_record(CSV_HEADER)?;
        }
        writer.write_record(&[
            entry.recorded_at.to_rfc3339(),
            entry.run_id.clone(),
            entry.model.clone(),
            entry.source_identity.to_string(),
            entry.row_number.to_string(),
            entry.dedupe_key.as_ref().map(|k| k.to_string()).unwrap_or_default(),
            entry.state.to_string(),
            entry.action.map(|a| a.to_string()).unwrap_or_default(),
            entry.remote_id.map(|id| id.to_string()).unwrap_or_default(),
            entry.error_message.clone().unwrap_or_default(),
            entry.batch_seq.map(|s| s.to_string()).unwrap_or_default(),
        ])?;
        let bytes = writer
            .into_inner()
            .map_err(|e| LedgerError::CsvError(e.to_string()))?;

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }
}

/// 追加前截掉崩溃留下的半行（未以换行结尾的部分从未被确认写入）
fn truncate_torn_tail(path: &Path) -> LedgerResult<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let bytes = fs::read(path)?;
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    warn!(path = %path.display(), dropped_bytes = bytes.len() - keep, "截断账本末尾不完整的行");
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(())
}

/// 读取 JSONL；末尾半行视为崩溃残留并忽略
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> LedgerResult<Vec<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<(usize, &str)> = raw
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .collect();

    let mut items = Vec::with_capacity(lines.len());
    for (pos, (line_no, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(e) if pos + 1 == lines.len() => {
                warn!(path = %path.display(), line = line_no + 1, error = %e, "忽略账本末尾不完整的行");
            }
            Err(e) => {
                return Err(LedgerError::Corrupted {
                    path: path.display().to_string(),
                    line: line_no + 1,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(items)
}

impl AuditLedger for FileLedger {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let dir = self.run_dir(&entry.run_id)?;
        let _guard = self.guard()?;
        fs::create_dir_all(&dir)?;

        self.append_line(&dir.join(LEDGER_FILE), entry)?;
        if self.csv_mirror {
            self.append_csv(&dir.join(LEDGER_CSV_FILE), entry)?;
        }
        Ok(())
    }

    fn entries(&self, run_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let dir = self.run_dir(run_id)?;
        read_jsonl(&dir.join(LEDGER_FILE))
    }

    fn mark_checkpoint(&self, checkpoint: &BatchCheckpoint) -> LedgerResult<()> {
        let dir = self.run_dir(&checkpoint.run_id)?;
        let _guard = self.guard()?;
        fs::create_dir_all(&dir)?;
        self.append_line(&dir.join(CHECKPOINT_FILE), checkpoint)
    }

    fn checkpoints(&self, run_id: &str) -> LedgerResult<Vec<BatchCheckpoint>> {
        let dir = self.run_dir(run_id)?;
        let all: Vec<BatchCheckpoint> = read_jsonl(&dir.join(CHECKPOINT_FILE))?;

        let mut seen = HashSet::new();
        Ok(all
            .into_iter()
            .filter(|c| seen.insert((c.model.clone(), c.batch_seq)))
            .collect())
    }

    fn save_run(&self, run: &MigrationRun) -> LedgerResult<()> {
        let dir = self.run_dir(&run.run_id)?;
        let _guard = self.guard()?;
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!("{}.tmp", RUN_FILE));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(run)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(RUN_FILE))?;
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> LedgerResult<Option<MigrationRun>> {
        let path = self.run_dir(run_id)?.join(RUN_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::SourceIdentity;
    use crate::domain::types::{RecordState, WriteAction};
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(run_id: &str, row: usize) -> LedgerEntry {
        LedgerEntry {
            recorded_at: Utc::now(),
            run_id: run_id.to_string(),
            model: "res.partner".to_string(),
            source_identity: SourceIdentity::new("p.csv@abc", row),
            row_number: row,
            dedupe_key: None,
            state: RecordState::Imported,
            action: Some(WriteAction::Create),
            remote_id: Some(row as i64),
            error_message: None,
            batch_seq: Some(0),
        }
    }

    #[test]
    fn test_append_and_read_back_in_order() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), true).unwrap();
        for row in 1..=3 {
            ledger.append(&entry("run-1", row)).unwrap();
        }

        let entries = ledger.entries("run-1").unwrap();
        let rows: Vec<usize> = entries.iter().map(|e| e.row_number).collect();
        assert_eq!(rows, vec![1, 2, 3]);

        let csv = fs::read_to_string(dir.path().join("run-1").join(LEDGER_CSV_FILE)).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("recorded_at,run_id"));
    }

    #[test]
    fn test_torn_trailing_line_is_ignored() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), false).unwrap();
        ledger.append(&entry("run-2", 1)).unwrap();

        let path = dir.path().join("run-2").join(LEDGER_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"recorded_at\":\"2026-").unwrap();

        let entries = ledger.entries("run-2").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(ledger.load("run-2").unwrap().contains(&SourceIdentity::new("p.csv@abc", 1)));

        // 续写前截掉半行，之后读取不报损坏
        drop(file);
        ledger.append(&entry("run-2", 2)).unwrap();
        assert_eq!(ledger.entries("run-2").unwrap().len(), 2);
    }

    #[test]
    fn test_torn_csv_row_dropped_before_next_append() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), true).unwrap();
        ledger.append(&entry("run-5", 1)).unwrap();

        let path = dir.path().join("run-5").join(LEDGER_CSV_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2026-10-16T08:00:00+00:00,run-5,res.par").unwrap();
        drop(file);

        ledger.append(&entry("run-5", 2)).unwrap();
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<String> = reader
            .records()
            .map(|r| r.unwrap()[4].to_string())
            .collect();
        assert_eq!(rows, vec!["1", "2"]);
    }

    #[test]
    fn test_corrupted_middle_line_is_error() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), false).unwrap();
        ledger.append(&entry("run-3", 1)).unwrap();
        let path = dir.path().join("run-3").join(LEDGER_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage\n").unwrap();
        drop(file);
        ledger.append(&entry("run-3", 2)).unwrap();

        assert!(matches!(
            ledger.entries("run-3"),
            Err(LedgerError::Corrupted { line: 2, .. })
        ));
    }

    #[test]
    fn test_checkpoints_deduplicated() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), false).unwrap();
        let cp = BatchCheckpoint::new("run-4", "res.partner", 0, 10);
        ledger.mark_checkpoint(&cp).unwrap();
        ledger.mark_checkpoint(&cp).unwrap();
        ledger
            .mark_checkpoint(&BatchCheckpoint::new("run-4", "res.partner", 1, 5))
            .unwrap();
        assert_eq!(ledger.checkpoints("run-4").unwrap().len(), 2);
    }

    #[test]
    fn test_run_metadata_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), false).unwrap();
        let run = MigrationRun::start("plan", "fp", vec!["res.partner".to_string()]);
        ledger.save_run(&run).unwrap();
        assert_eq!(ledger.load_run(&run.run_id).unwrap(), Some(run));
        assert_eq!(ledger.load_run("nope").unwrap(), None);
    }

    #[test]
    fn test_rejects_path_like_run_id() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), false).unwrap();
        assert!(ledger.entries("../etc").is_err());
    }
}
