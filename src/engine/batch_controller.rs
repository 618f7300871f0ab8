// ==========================================
// 批量迁移引擎 - 批次控制器
// ==========================================
// 流程（每个模型，按优先级升序）:
// 1. 批前决定: 转换/校验 -> 运行内去重（INVALID / 批内重复排队待入账）
// 2. 待写入记录按 chunk_size 切批，批号从 0 开始
// 3. 每批: 远端去重 -> 引用解析 -> 写入（带重试）-> 按源顺序入账 -> 批次标记
// 红线: 账本顺序与源行顺序一致（批前决定的记录与批次结果交错入账）
// 红线: 致命错误中止运行；记录级错误只进账本
// 红线: 续跑时已标记批次整体跳过，不发起任何远端调用
// ==========================================

use crate::config::plan::MigrationPlan;
use crate::domain::ledger::{BatchCheckpoint, LedgerEntry, MigrationRun, RunCounters};
use crate::domain::record::{MigrationRecord, SourceIdentity, SourceRow, WriteIntent};
use crate::domain::schema::ValidationSchema;
use crate::domain::types::{RecordState, RemoteId, RunStatus};
use crate::engine::deduplicator::{resolve_remote, Deduplicator, LookupSettings};
use crate::engine::error::{EngineError, EngineResult, RemoteError};
use crate::engine::pipeline::TransformPipeline;
use crate::engine::reference::{resolve_references, ReferenceCache};
use crate::engine::retry::{run_with_retry, RetryPolicy};
use crate::engine::transform::TransformRegistry;
use crate::remote::RemoteService;
use crate::report::summary::RunSummary;
use crate::repository::ledger_repo::{checkpoint_set, AuditLedger, CompletedSet};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

// ==========================================
// 对外结果类型
// ==========================================

/// 一次运行（或续跑）的结果
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: MigrationRun,
    pub summary: RunSummary,
}

/// 仅校验模式下单个模型的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewCounts {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

/// 仅校验模式下的问题记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewIssue {
    pub model: String,
    pub identity: SourceIdentity,
    pub row_number: usize,
    pub state: RecordState,
    pub message: String,
}

/// 仅校验（不写账本、不调远端）的预览结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationPreview {
    pub totals: PreviewCounts,
    pub per_model: BTreeMap<String, PreviewCounts>,
    pub issues: Vec<PreviewIssue>,
}

// ==========================================
// 内部类型
// ==========================================

/// 批次中的一个位置（续跑时已完成记录保留位置，批次划分不变）
enum Slot {
    Done,
    Pending(MigrationRecord),
}

/// 跨模型共享的运行内状态
struct RunMemory {
    dedupe: Deduplicator,
    references: ReferenceCache,
}

/// 单个模型处理过程中的状态
#[derive(Default)]
struct ModelProgress {
    leader_ids: HashMap<SourceIdentity, RemoteId>,
    /// 源行在本模型中的位置
    positions: HashMap<SourceIdentity, usize>,
    /// 批前已决定、尚未入账的记录（按位置升序）
    decided: VecDeque<(usize, MigrationRecord)>,
}

impl ModelProgress {
    fn position(&self, identity: &SourceIdentity) -> usize {
        self.positions.get(identity).copied().unwrap_or(usize::MAX)
    }

    /// 取出位置在 before 之前的已决定记录
    fn decided_before(&mut self, before: usize) -> Vec<MigrationRecord> {
        let mut ready = Vec::new();
        while self.decided.front().is_some_and(|(position, _)| *position < before) {
            if let Some((_, record)) = self.decided.pop_front() {
                ready.push(record);
            }
        }
        ready
    }
}

enum ModelOutcome {
    Completed,
    Interrupted,
    Aborted(String),
}

enum WriteTarget {
    Create,
    Update(RemoteId),
    LeaderMissing(String),
}

enum WriteOutcome {
    Finished(MigrationRecord),
    Fatal(RemoteError),
    NotAttempted,
}

/// 按固定大小切分，保持顺序
fn into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// 跟随首条记录的更新与首条记录在同一段时，另起一段顺序执行
fn into_segments(records: Vec<MigrationRecord>) -> Vec<Vec<MigrationRecord>> {
    let mut segments = Vec::new();
    let mut current: Vec<MigrationRecord> = Vec::new();
    let mut in_current: HashSet<SourceIdentity> = HashSet::new();

    for record in records {
        let waits_for_current = match &record.intent {
            WriteIntent::UpdateLeader(leader) => {
                !record.state.is_terminal() && in_current.contains(leader)
            }
            _ => false,
        };
        if waits_for_current {
            segments.push(std::mem::take(&mut current));
            in_current.clear();
        }
        in_current.insert(record.identity.clone());
        current.push(record);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn write_target(record: &MigrationRecord, leader_ids: &HashMap<SourceIdentity, RemoteId>) -> WriteTarget {
    match &record.intent {
        WriteIntent::Create => WriteTarget::Create,
        WriteIntent::Update(id) => WriteTarget::Update(*id),
        WriteIntent::UpdateLeader(leader) => match leader_ids.get(leader) {
            Some(id) => WriteTarget::Update(*id),
            None => WriteTarget::LeaderMissing(format!("首条记录 {} 未成功导入", leader)),
        },
    }
}

// ==========================================
// BatchController
// ==========================================
pub struct BatchController {
    plan: Arc<MigrationPlan>,
    pipeline: TransformPipeline,
    ledger: Arc<dyn AuditLedger>,
    remote: Arc<dyn RemoteService>,
    retry: RetryPolicy,
    lookup: LookupSettings,
    stop: Arc<AtomicBool>,
}

impl BatchController {
    /// 创建控制器（计划校验、正则编译、转换名检查都在此完成）
    pub fn new(
        plan: Arc<MigrationPlan>,
        ledger: Arc<dyn AuditLedger>,
        remote: Arc<dyn RemoteService>,
    ) -> EngineResult<Self> {
        let registry = TransformRegistry::new(&plan.engine.default_country_code)?;
        Self::with_registry(plan, registry, ledger, remote)
    }

    /// 使用带自定义转换的注册表创建
    pub fn with_registry(
        plan: Arc<MigrationPlan>,
        registry: TransformRegistry,
        ledger: Arc<dyn AuditLedger>,
        remote: Arc<dyn RemoteService>,
    ) -> EngineResult<Self> {
        plan.validate()?;
        let pipeline = TransformPipeline::with_registry(&plan, registry)?;
        let lookup = LookupSettings::from_config(&plan.engine);
        Ok(Self {
            retry: RetryPolicy::from_config(&plan.engine),
            lookup,
            plan,
            pipeline,
            ledger,
            remote,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 替换重试策略（写入与远端去重查询共用）
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.lookup.retry = policy.clone();
        self.retry = policy;
        self
    }

    /// 使用外部共享的停止标记
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = flag;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// 请求在当前批次结束后停止
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    // ==========================================
    // 运行入口
    // ==========================================

    /// 新建一次运行
    #[instrument(skip(self, rows), fields(plan = %self.plan.name, rows = rows.len()))]
    pub async fn run(&self, rows: Vec<SourceRow>) -> EngineResult<RunReport> {
        let grouped = self.group_rows(rows)?;
        let models = self
            .plan
            .ordered_models()
            .iter()
            .map(|s| s.model.clone())
            .collect();

        let run = MigrationRun::start(&self.plan.name, &self.plan.fingerprint(), models);
        self.ledger.save_run(&run)?;
        info!(run_id = %run.run_id, "开始迁移运行");

        self.execute(run, grouped, CompletedSet::default(), HashSet::new())
            .await
    }

    /// 续跑一次未完成的运行
    ///
    /// 账本中已有终态的记录不再处理；已标记批次整体跳过。
    #[instrument(skip(self, rows), fields(plan = %self.plan.name, rows = rows.len()))]
    pub async fn resume(&self, run_id: &str, rows: Vec<SourceRow>) -> EngineResult<RunReport> {
        let mut run = self
            .ledger
            .load_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        let fingerprint = self.plan.fingerprint();
        if run.plan_fingerprint != fingerprint {
            return Err(EngineError::PlanChanged {
                run_id: run_id.to_string(),
                expected: run.plan_fingerprint,
                actual: fingerprint,
            });
        }

        if run.status == RunStatus::Completed {
            info!(run_id, "运行已完成，无需续跑");
            let entries = self.ledger.entries(run_id)?;
            let summary = RunSummary::build(&run, &entries);
            return Ok(RunReport { run, summary });
        }

        let grouped = self.group_rows(rows)?;
        let completed = self.ledger.load(run_id)?;
        let checkpoints = checkpoint_set(&self.ledger.checkpoints(run_id)?);

        run.resume_count += 1;
        run.status = RunStatus::Running;
        run.abort_reason = None;
        run.finished_at = None;
        self.ledger.save_run(&run)?;
        info!(
            run_id,
            resume_count = run.resume_count,
            completed_records = completed.len(),
            completed_batches = checkpoints.len(),
            "续跑迁移运行"
        );

        self.execute(run, grouped, completed, checkpoints).await
    }

    /// 只做转换、校验与运行内去重（不写账本、不调远端）
    pub fn validate_only(&self, rows: &[SourceRow]) -> EngineResult<ValidationPreview> {
        let mut grouped: HashMap<&str, Vec<&SourceRow>> = HashMap::new();
        for row in rows {
            self.ensure_known_model(row)?;
            grouped.entry(row.model.as_str()).or_default().push(row);
        }

        let mut preview = ValidationPreview::default();
        let mut dedupe = Deduplicator::new();
        for schema in self.plan.ordered_models() {
            let Some(model_rows) = grouped.get(schema.model.as_str()) else {
                continue;
            };
            let mut counts = PreviewCounts::default();
            for row in model_rows {
                let mut record = self.pipeline.prepare(row, schema)?;
                counts.total += 1;
                if record.state == RecordState::Valid {
                    if let Some(cfg) = &schema.dedupe {
                        dedupe.check_batch(&mut record, cfg)?;
                    }
                }

                match record.state {
                    RecordState::Invalid => counts.invalid += 1,
                    RecordState::DuplicateSkipped => counts.duplicates += 1,
                    _ => counts.valid += 1,
                }
                if record.state.is_terminal() {
                    preview.issues.push(PreviewIssue {
                        model: record.model.clone(),
                        identity: record.identity.clone(),
                        row_number: record.row_number,
                        state: record.state,
                        message: record.error_message().unwrap_or_default(),
                    });
                }
            }

            preview.totals.total += counts.total;
            preview.totals.valid += counts.valid;
            preview.totals.invalid += counts.invalid;
            preview.totals.duplicates += counts.duplicates;
            preview.per_model.insert(schema.model.clone(), counts);
        }
        Ok(preview)
    }

    /// 由账本重建某次运行的汇总
    pub fn summary(&self, run_id: &str) -> EngineResult<RunSummary> {
        let run = self
            .ledger
            .load_run(run_id)?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let entries = self.ledger.entries(run_id)?;
        Ok(RunSummary::build(&run, &entries))
    }

    // ==========================================
    // 运行主体
    // ==========================================

    fn ensure_known_model(&self, row: &SourceRow) -> EngineResult<()> {
        match self.plan.model(&row.model) {
            None => Err(EngineError::UnknownModel {
                model: row.model.clone(),
                identity: row.identity.to_string(),
            }),
            Some(schema) if !schema.enabled => Err(EngineError::ModelDisabled {
                model: row.model.clone(),
                identity: row.identity.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// 按模型分组（保持源顺序）；未知或已停用模型在任何写入前报错
    fn group_rows(&self, rows: Vec<SourceRow>) -> EngineResult<HashMap<String, Vec<SourceRow>>> {
        let mut grouped: HashMap<String, Vec<SourceRow>> = HashMap::new();
        for row in rows {
            self.ensure_known_model(&row)?;
            grouped.entry(row.model.clone()).or_default().push(row);
        }
        Ok(grouped)
    }

    async fn execute(
        &self,
        mut run: MigrationRun,
        grouped: HashMap<String, Vec<SourceRow>>,
        completed: CompletedSet,
        checkpoints: HashSet<(String, u32)>,
    ) -> EngineResult<RunReport> {
        let mut memory = RunMemory {
            dedupe: Deduplicator::new(),
            references: ReferenceCache::for_plan(&self.plan),
        };
        let mut outcome = ModelOutcome::Completed;

        for schema in self.plan.ordered_models() {
            let rows = grouped
                .get(&schema.model)
                .map(Vec::as_slice)
                .unwrap_or_default();
            outcome = self
                .run_model(&run.run_id, schema, rows, &completed, &checkpoints, &mut memory)
                .await?;

            if !matches!(outcome, ModelOutcome::Completed) {
                break;
            }
            if !run.models_completed.contains(&schema.model) {
                run.models_completed.push(schema.model.clone());
            }
            self.ledger.save_run(&run)?;
        }

        let entries = self.ledger.entries(&run.run_id)?;
        run.counters = RunCounters::from_entries(&entries);
        run.finished_at = Some(Utc::now());
        match &outcome {
            ModelOutcome::Completed => run.status = RunStatus::Completed,
            ModelOutcome::Interrupted => run.status = RunStatus::Interrupted,
            ModelOutcome::Aborted(reason) => {
                run.status = RunStatus::Aborted;
                run.abort_reason = Some(reason.clone());
            }
        }
        self.ledger.save_run(&run)?;

        if let ModelOutcome::Aborted(reason) = outcome {
            error!(run_id = %run.run_id, reason = %reason, "运行中止");
            return Err(EngineError::RunAborted {
                run_id: run.run_id,
                reason,
            });
        }

        info!(
            run_id = %run.run_id,
            status = %run.status.as_str(),
            total = run.counters.total,
            imported = run.counters.imported,
            failed = run.counters.failed,
            "迁移运行结束"
        );
        let summary = RunSummary::build(&run, &entries);
        Ok(RunReport { run, summary })
    }

    fn append(&self, run_id: &str, record: &MigrationRecord) -> EngineResult<()> {
        self.ledger.append(&LedgerEntry::from_record(run_id, record))?;
        Ok(())
    }

    /// 先补记源位置更靠前的已决定记录，再记本条
    fn append_in_order(
        &self,
        run_id: &str,
        record: &MigrationRecord,
        progress: &mut ModelProgress,
    ) -> EngineResult<()> {
        let position = progress.position(&record.identity);
        for decided in progress.decided_before(position) {
            self.append(run_id, &decided)?;
        }
        self.append(run_id, record)
    }

    /// 处理单个模型
    async fn run_model(
        &self,
        run_id: &str,
        schema: &ValidationSchema,
        rows: &[SourceRow],
        completed: &CompletedSet,
        checkpoints: &HashSet<(String, u32)>,
        memory: &mut RunMemory,
    ) -> EngineResult<ModelOutcome> {
        if self.stop.load(Ordering::SeqCst) {
            info!(run_id, model = %schema.model, "收到停止请求，运行挂起");
            return Ok(ModelOutcome::Interrupted);
        }

        let model = schema.model.as_str();
        let dedupe_cfg = schema.dedupe.as_ref();
        let mut slots = Vec::with_capacity(rows.len());
        let mut progress = ModelProgress::default();

        // ===== 批前决定 =====
        for (position, row) in rows.iter().enumerate() {
            progress.positions.insert(row.identity.clone(), position);
            if let Some(entry) = completed.get(&row.identity) {
                if let (Some(cfg), Some(key)) = (dedupe_cfg, entry.dedupe_key.as_ref()) {
                    if cfg.match_batch {
                        memory.dedupe.register(model, key, &row.identity);
                    }
                }
                if let (RecordState::Imported, Some(id)) = (entry.state, entry.remote_id) {
                    progress.leader_ids.insert(row.identity.clone(), id);
                    if memory.references.is_target(model) {
                        let replayed = self.pipeline.prepare(row, schema)?;
                        memory.references.remember(model, &replayed.values, id);
                    }
                }
                if entry.batch_seq.is_some() {
                    slots.push(Slot::Done);
                }
                continue;
            }

            let mut record = self.pipeline.prepare(row, schema)?;
            if record.state == RecordState::Valid {
                if let Some(cfg) = dedupe_cfg {
                    memory.dedupe.check_batch(&mut record, cfg)?;
                }
            }
            if record.state.is_terminal() {
                debug!(run_id, model, identity = %record.identity, state = %record.state, "批前决定");
                progress.decided.push_back((position, record));
                continue;
            }

            record.transition(RecordState::UniqueOrUpdate)?;
            slots.push(Slot::Pending(record));
        }

        let batches = into_batches(slots, self.plan.engine.chunk_size);
        info!(run_id, model, batches = batches.len(), "开始处理模型");

        // ===== 按批写入 =====
        for (index, batch) in batches.into_iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                info!(run_id, model, batch_seq = index, "收到停止请求，运行挂起");
                return Ok(ModelOutcome::Interrupted);
            }

            let batch_seq = index as u32;
            if checkpoints.contains(&(model.to_string(), batch_seq)) {
                debug!(run_id, model, batch_seq, "批次已完成，跳过");
                continue;
            }

            let record_count = batch.len();
            let mut pending: Vec<MigrationRecord> = batch
                .into_iter()
                .filter_map(|slot| match slot {
                    Slot::Pending(record) => Some(record),
                    Slot::Done => None,
                })
                .collect();
            for record in &mut pending {
                record.batch_seq = Some(batch_seq);
            }

            if let Some(reason) = self
                .process_batch(run_id, schema, batch_seq, pending, &mut progress, memory)
                .await?
            {
                return Ok(ModelOutcome::Aborted(reason));
            }

            self.ledger
                .mark_checkpoint(&BatchCheckpoint::new(run_id, model, batch_seq, record_count))?;
            info!(run_id, model, batch_seq, record_count, "批次完成");
        }

        for decided in progress.decided_before(usize::MAX) {
            self.append(run_id, &decided)?;
        }
        Ok(ModelOutcome::Completed)
    }

    /// 处理一个批次；返回 Some(原因) 表示遇到致命错误
    async fn process_batch(
        &self,
        run_id: &str,
        schema: &ValidationSchema,
        batch_seq: u32,
        mut pending: Vec<MigrationRecord>,
        progress: &mut ModelProgress,
        memory: &mut RunMemory,
    ) -> EngineResult<Option<String>> {
        let model = schema.model.as_str();
        if pending.is_empty() {
            return Ok(None);
        }

        if let Some(cfg) = &schema.dedupe {
            match resolve_remote(self.remote.as_ref(), model, cfg, &mut pending, &self.lookup).await {
                Ok(_) => {}
                Err(EngineError::Remote(err)) => {
                    error!(run_id, model, batch_seq, error = %err, "远端去重查询遇到致命错误");
                    return Ok(Some(err.to_string()));
                }
                Err(other) => return Err(other),
            }
        }

        match resolve_references(
            self.remote.as_ref(),
            schema,
            &mut pending,
            &mut memory.references,
            &self.lookup,
        )
        .await
        {
            Ok(_) => {}
            Err(EngineError::Remote(err)) => {
                error!(run_id, model, batch_seq, error = %err, "引用解析遇到致命错误");
                return Ok(Some(err.to_string()));
            }
            Err(other) => return Err(other),
        }

        let workers = self.plan.engine.workers();
        let aborted = AtomicBool::new(false);
        let mut fatal: Option<RemoteError> = None;

        for segment in into_segments(pending) {
            if aborted.load(Ordering::SeqCst) {
                break;
            }

            let writes: Vec<(MigrationRecord, WriteTarget)> = segment
                .into_iter()
                .map(|record| {
                    let target = write_target(&record, &progress.leader_ids);
                    (record, target)
                })
                .collect();

            let aborted = &aborted;
            let mut outcomes = stream::iter(writes)
                .map(|(record, target)| self.write_one(model, record, target, aborted))
                .buffered(workers);

            while let Some(outcome) = outcomes.next().await {
                match outcome? {
                    WriteOutcome::Finished(record) => {
                        self.append_in_order(run_id, &record, progress)?;
                        if let (RecordState::Imported, Some(id)) = (record.state, record.remote_id) {
                            progress.leader_ids.insert(record.identity.clone(), id);
                            memory.references.remember(model, &record.values, id);
                        }
                    }
                    WriteOutcome::Fatal(err) => {
                        fatal.get_or_insert(err);
                    }
                    WriteOutcome::NotAttempted => {}
                }
            }
        }

        Ok(fatal.map(|err| err.to_string()))
    }

    /// 写入单条记录（已有终态的记录原样返回）
    async fn write_one(
        &self,
        model: &str,
        mut record: MigrationRecord,
        target: WriteTarget,
        aborted: &AtomicBool,
    ) -> EngineResult<WriteOutcome> {
        if record.state.is_terminal() {
            return Ok(WriteOutcome::Finished(record));
        }

        let target = match target {
            WriteTarget::LeaderMissing(reason) => {
                record.fail(reason)?;
                return Ok(WriteOutcome::Finished(record));
            }
            other => other,
        };

        if aborted.load(Ordering::SeqCst) {
            return Ok(WriteOutcome::NotAttempted);
        }

        let remote = self.remote.as_ref();
        let values = &record.values;
        let result = match target {
            WriteTarget::Update(id) => {
                run_with_retry(&self.retry, "update", move || remote.update(model, id, values))
                    .await
                    .map(|_| id)
            }
            _ => run_with_retry(&self.retry, "create", move || remote.create(model, values)).await,
        };

        match result {
            Ok(id) => {
                record.remote_id = Some(id);
                record.transition(RecordState::Imported)?;
                Ok(WriteOutcome::Finished(record))
            }
            Err(err) if err.is_fatal() => {
                aborted.store(true, Ordering::SeqCst);
                error!(model, identity = %record.identity, error = %err, "远端致命错误，停止后续写入");
                Ok(WriteOutcome::Fatal(err))
            }
            Err(err) => {
                warn!(model, identity = %record.identity, error = %err, "记录写入失败");
                record.fail(err.to_string())?;
                Ok(WriteOutcome::Finished(record))
            }
        }
    }
}
