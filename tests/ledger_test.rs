// ==========================================
// 审计账本集成测试
// ==========================================
// 测试目标: 进程重启后续跑 / 半行容错 / 两种后端 / 只追加约束
// ==========================================


use bulk_migrator::config::EngineConfig;
use bulk_migrator::domain::{LedgerBackend, MigrationRun, RecordState, RunStatus};
use bulk_migrator::engine::{EngineError, RemoteError};
use bulk_migrator::remote::{FaultRule, InMemoryRemote, RemoteOp};
use bulk_migrator::repository::{open_ledger, AuditLedger, FileLedger, SqliteLedger, SQLITE_LEDGER_FILE};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use test_helpers::*;

#[tokio::test]
async fn test_resume_with_reopened_ledger_after_torn_write() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    remote.inject(
        FaultRule::on(RemoteOp::Create, RemoteError::Unreachable("network down".into()))
            .when_field("name", "r4")
            .times(1),
    );
    let plan = build_plan(partner_plan("skip", &["name"], 2));
    let rows = named_rows(5);

    let first = Arc::new(FileLedger::new(dir.path(), true).unwrap());
    let err = controller(plan.clone(), first, remote.clone())
        .run(rows.clone())
        .await
        .unwrap_err();
    let EngineError::RunAborted { run_id, .. } = err else {
        panic!("expected abort");
    };

    // 模拟崩溃: 账本末尾留下半行
    let jsonl = dir.path().join(&run_id).join("ledger.jsonl");
    let mut file = OpenOptions::new().append(true).open(&jsonl).unwrap();
    file.write_all(b"{\"recorded_at\":\"2026-10-").unwrap();
    drop(file);

    let reopened = Arc::new(FileLedger::new(dir.path(), true).unwrap());
    assert_eq!(reopened.entries(&run_id).unwrap().len(), 3);

    remote.clear_calls();
    let report = controller(plan, reopened.clone(), remote.clone())
        .resume(&run_id, rows)
        .await
        .unwrap();
    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(created_names(&remote), vec!["r4", "r5"]);

    let entries = reopened.entries(&run_id).unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.state == RecordState::Imported));

    let csv = std::fs::read_to_string(dir.path().join(&run_id).join("ledger.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert!(lines[0].starts_with("recorded_at,run_id,model"));
    assert_eq!(lines.len(), 6);
}

#[test]
fn test_open_ledger_selects_backend() {
    let dir = TempDir::new().unwrap();
    let run = MigrationRun::start("plan", "fp", vec![PARTNER.to_string()]);

    let sqlite_cfg = EngineConfig {
        ledger_backend: LedgerBackend::Sqlite,
        ledger_dir: Some(dir.path().join("sqlite")),
        ..EngineConfig::default()
    };
    let sqlite = open_ledger(&sqlite_cfg).unwrap();
    sqlite.save_run(&run).unwrap();
    assert!(dir.path().join("sqlite").join(SQLITE_LEDGER_FILE).exists());
    assert_eq!(sqlite.load_run(&run.run_id).unwrap().unwrap().plan_name, "plan");

    let jsonl_cfg = EngineConfig {
        ledger_dir: Some(dir.path().join("files")),
        ..EngineConfig::default()
    };
    let files = open_ledger(&jsonl_cfg).unwrap();
    files.save_run(&run).unwrap();
    assert!(dir
        .path()
        .join("files")
        .join(&run.run_id)
        .join("run.json")
        .exists());
}

#[tokio::test]
async fn test_sqlite_ledger_survives_reopen_and_rejects_mutation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(SQLITE_LEDGER_FILE);
    let path_str = path.to_string_lossy().to_string();
    let remote = Arc::new(InMemoryRemote::new());
    let plan = build_plan(partner_plan("skip", &["name"], 2));

    let run_id = {
        let ledger = Arc::new(SqliteLedger::new(&path_str).unwrap());
        let report = controller(plan, ledger, remote).run(named_rows(3)).await.unwrap();
        report.run.run_id
    };

    let reopened = SqliteLedger::new(&path_str).unwrap();
    assert_eq!(reopened.entries(&run_id).unwrap().len(), 3);
    assert_eq!(reopened.checkpoints(&run_id).unwrap().len(), 2);
    assert_eq!(
        reopened.load_run(&run_id).unwrap().unwrap().status,
        RunStatus::Completed
    );

    let conn = rusqlite::Connection::open(&path).unwrap();
    let err = conn
        .execute("DELETE FROM ledger_entry WHERE run_id = ?1", [&run_id])
        .unwrap_err();
    assert!(err.to_string().contains("append-only"));
    assert_eq!(reopened.entries(&run_id).unwrap().len(), 3);
}
