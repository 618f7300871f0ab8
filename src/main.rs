// ==========================================
// 批量迁移引擎 - 命令行入口
// ==========================================
// 用法:
//   bulk-migrator <plan.json> [--resume RUN_ID] [--validate-only]
//                 [--ledger-dir DIR] [--locale en|zh-CN] [--json-logs]
//                 [--config-db PATH]
// 远端为内存实现（演练运行），真实传输层由外部提供
// ==========================================

use anyhow::{anyhow, bail, Context};
use bulk_migrator::config::{ConfigManager, MigrationPlan};
use bulk_migrator::engine::{BatchController, EngineError, ValidationPreview};
use bulk_migrator::i18n::{is_supported, t_in};
use bulk_migrator::importer::load_plan_sources;
use bulk_migrator::remote::{InMemoryRemote, RemoteService};
use bulk_migrator::repository::open_ledger;
use bulk_migrator::{logging, APP_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

const USAGE: &str = "用法: bulk-migrator <plan.json> [--resume RUN_ID] [--validate-only] \
[--ledger-dir DIR] [--locale en|zh-CN] [--json-logs] [--config-db PATH]";

#[derive(Debug, Default)]
struct CliArgs {
    plan_path: PathBuf,
    resume: Option<String>,
    validate_only: bool,
    ledger_dir: Option<PathBuf>,
    locale: Option<String>,
    json_logs: bool,
    config_db: Option<String>,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = CliArgs::default();
        let mut plan_path = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--resume" => parsed.resume = Some(value_of(&mut args, "--resume")?),
                "--validate-only" => parsed.validate_only = true,
                "--ledger-dir" => {
                    parsed.ledger_dir = Some(PathBuf::from(value_of(&mut args, "--ledger-dir")?))
                }
                "--locale" => parsed.locale = Some(value_of(&mut args, "--locale")?),
                "--json-logs" => parsed.json_logs = true,
                "--config-db" => parsed.config_db = Some(value_of(&mut args, "--config-db")?),
                "-h" | "--help" => bail!(USAGE),
                other if other.starts_with("--") => bail!("未知参数: {}\n{}", other, USAGE),
                other => {
                    if plan_path.replace(PathBuf::from(other)).is_some() {
                        bail!("只能指定一个计划文件\n{}", USAGE);
                    }
                }
            }
        }

        parsed.plan_path = plan_path.ok_or_else(|| anyhow!(USAGE))?;
        Ok(parsed)
    }
}

fn value_of(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next()
        .filter(|v| !v.starts_with("--"))
        .ok_or_else(|| anyhow!("参数 {} 缺少取值", flag))
}

fn render_preview(preview: &ValidationPreview, locale: &str) -> String {
    let totals = &preview.totals;
    let mut lines = vec![
        t_in(locale, "preview.title", &[]),
        t_in(
            locale,
            "preview.totals",
            &[
                ("total", &totals.total.to_string()),
                ("valid", &totals.valid.to_string()),
                ("invalid", &totals.invalid.to_string()),
                ("duplicates", &totals.duplicates.to_string()),
            ],
        ),
    ];
    for issue in &preview.issues {
        lines.push(format!(
            "  {} [{}] {}",
            issue.identity, issue.state, issue.message
        ));
    }
    lines.join("\n")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse(std::env::args().skip(1))?;

    // 初始化日志系统
    if args.json_logs {
        logging::init_json();
    } else {
        logging::init();
    }
    info!("{} v{}", APP_NAME, VERSION);

    let locale = args.locale.clone().unwrap_or_else(|| "zh-CN".to_string());
    if !is_supported(&locale) {
        bail!("不支持的语言: {}", locale);
    }

    let mut plan = MigrationPlan::from_path(&args.plan_path)
        .with_context(|| format!("读取计划失败: {}", args.plan_path.display()))?;
    if let Some(db_path) = &args.config_db {
        let manager = ConfigManager::new(db_path)?;
        plan.engine = manager.apply_overrides(&plan.engine)?;
        info!(db_path = %db_path, "已应用持久化配置覆写");
    }
    if let Some(dir) = &args.ledger_dir {
        plan.engine.ledger_dir = Some(dir.clone());
    }

    let base_dir = args
        .plan_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let rows = load_plan_sources(&plan, &base_dir)?;
    info!(rows = rows.len(), "源文件读取完成");

    let plan = Arc::new(plan);
    let ledger = open_ledger(&plan.engine)?;
    let remote: Arc<dyn RemoteService> = Arc::new(InMemoryRemote::new());
    let controller = BatchController::new(plan.clone(), ledger, remote)?;

    if args.validate_only {
        let preview = controller.validate_only(&rows)?;
        println!("{}", render_preview(&preview, &locale));
        return Ok(());
    }

    // Ctrl-C: 当前批次结束后停止，运行可续跑
    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，当前批次结束后停止");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let result = match &args.resume {
        Some(run_id) => controller.resume(run_id, rows).await,
        None => controller.run(rows).await,
    };

    match result {
        Ok(report) => {
            println!("{}", report.summary.render(&locale));
            Ok(())
        }
        Err(EngineError::RunAborted { run_id, reason }) => {
            let summary = controller.summary(&run_id)?;
            println!("{}", summary.render(&locale));
            bail!("运行 {} 已中止: {}（修复后可用 --resume {} 续跑）", run_id, reason, run_id)
        }
        Err(err) => Err(err.into()),
    }
}
