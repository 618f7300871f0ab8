// ==========================================
// 批量迁移引擎 - 运行汇总
// ==========================================
// 只由账本条目与运行元数据生成，不读取引擎内存状态
// ==========================================

use crate::domain::ledger::{LedgerEntry, MigrationRun, RunCounters};
use crate::domain::types::{RecordState, RunStatus};
use crate::i18n::t_in;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// 汇总中保留的常见错误条数
pub const TOP_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_name: String,
    pub status: RunStatus,
    pub abort_reason: Option<String>,
    pub resume_count: u32,
    pub counters: RunCounters,
    pub per_model: BTreeMap<String, RunCounters>,
    /// 导入数 / 总数 * 100
    pub success_rate: f64,
    pub duration_secs: Option<i64>,
    pub models_completed: Vec<String>,
    pub top_errors: Vec<ErrorCount>,
}

impl RunSummary {
    pub fn build(run: &MigrationRun, entries: &[LedgerEntry]) -> Self {
        let counters = RunCounters::from_entries(entries);

        let mut per_model: BTreeMap<String, RunCounters> = BTreeMap::new();
        for entry in entries {
            per_model.entry(entry.model.clone()).or_default().add(entry);
        }

        let success_rate = if counters.total == 0 {
            0.0
        } else {
            counters.imported as f64 / counters.total as f64 * 100.0
        };

        Self {
            run_id: run.run_id.clone(),
            plan_name: run.plan_name.clone(),
            status: run.status,
            abort_reason: run.abort_reason.clone(),
            resume_count: run.resume_count,
            counters,
            per_model,
            success_rate,
            duration_secs: run.duration_secs(),
            models_completed: run.models_completed.clone(),
            top_errors: top_errors(entries, TOP_ERROR_LIMIT),
        }
    }

    /// 渲染为文本（显式语言，不依赖全局设置）
    pub fn render(&self, locale: &str) -> String {
        let c = &self.counters;
        let mut lines = vec![
            t_in(locale, "summary.title", &[]),
            t_in(
                locale,
                "summary.run",
                &[("run_id", &self.run_id), ("plan", &self.plan_name)],
            ),
            t_in(locale, "summary.status", &[("status", self.status.as_str())]),
        ];
        if let Some(reason) = &self.abort_reason {
            lines.push(t_in(locale, "summary.abort_reason", &[("reason", reason)]));
        }
        if self.resume_count > 0 {
            lines.push(t_in(
                locale,
                "summary.resumed",
                &[("count", &self.resume_count.to_string())],
            ));
        }

        lines.push(t_in(locale, "summary.total", &[("count", &c.total.to_string())]));
        lines.push(t_in(
            locale,
            "summary.imported",
            &[
                ("count", &c.imported.to_string()),
                ("created", &c.created.to_string()),
                ("updated", &c.updated.to_string()),
            ],
        ));
        lines.push(t_in(locale, "summary.invalid", &[("count", &c.invalid.to_string())]));
        lines.push(t_in(
            locale,
            "summary.duplicates",
            &[("count", &c.duplicate_skipped.to_string())],
        ));
        lines.push(t_in(locale, "summary.failed", &[("count", &c.failed.to_string())]));
        lines.push(t_in(
            locale,
            "summary.success_rate",
            &[("rate", &format!("{:.1}", self.success_rate))],
        ));
        if let Some(secs) = self.duration_secs {
            lines.push(t_in(
                locale,
                "summary.duration",
                &[("duration", &format_duration(secs))],
            ));
        }

        let models = if self.models_completed.is_empty() {
            t_in(locale, "summary.none", &[])
        } else {
            self.models_completed.join(", ")
        };
        lines.push(t_in(locale, "summary.models", &[("models", &models)]));

        if !self.per_model.is_empty() {
            lines.push(t_in(locale, "summary.per_model_title", &[]));
            for (model, m) in &self.per_model {
                lines.push(t_in(
                    locale,
                    "summary.per_model",
                    &[
                        ("model", model),
                        ("total", &m.total.to_string()),
                        ("imported", &m.imported.to_string()),
                        ("invalid", &m.invalid.to_string()),
                        ("duplicates", &m.duplicate_skipped.to_string()),
                        ("failed", &m.failed.to_string()),
                    ],
                ));
            }
        }

        if !self.top_errors.is_empty() {
            lines.push(t_in(locale, "summary.top_errors", &[]));
            for err in &self.top_errors {
                lines.push(t_in(
                    locale,
                    "summary.error_line",
                    &[("count", &err.count.to_string()), ("message", &err.message)],
                ));
            }
        }

        lines.join("\n")
    }
}

/// 秒数 -> "Xm Ys"
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}m {}s", secs / 60, secs % 60)
}

/// 统计 INVALID / FAILED 记录的错误信息，按出现次数降序
fn top_errors(entries: &[LedgerEntry], limit: usize) -> Vec<ErrorCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        if !matches!(entry.state, RecordState::Invalid | RecordState::Failed) {
            continue;
        }
        if let Some(message) = entry.error_message.as_deref() {
            *counts.entry(message).or_default() += 1;
        }
    }

    let mut errors: Vec<ErrorCount> = counts
        .into_iter()
        .map(|(message, count)| ErrorCount {
            message: message.to_string(),
            count,
        })
        .collect();
    errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    errors.truncate(limit);
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::SourceIdentity;
    use crate::domain::types::WriteAction;
    use chrono::{Duration, Utc};

    fn entry(model: &str, row: usize, state: RecordState, error: Option<&str>) -> LedgerEntry {
        LedgerEntry {
            recorded_at: Utc::now(),
            run_id: "r1".to_string(),
            model: model.to_string(),
            source_identity: SourceIdentity::new("f.csv@0", row),
            row_number: row,
            dedupe_key: None,
            state,
            action: (state == RecordState::Imported).then_some(WriteAction::Create),
            remote_id: None,
            error_message: error.map(str::to_string),
            batch_seq: Some(0),
        }
    }

    fn finished_run() -> MigrationRun {
        let mut run = MigrationRun::start("demo", "fp", vec!["res.partner".into()]);
        run.status = RunStatus::Completed;
        run.finished_at = Some(run.started_at + Duration::seconds(125));
        run.models_completed = vec!["res.partner".into()];
        run
    }

    #[test]
    fn test_build_counts_and_rate() {
        let entries = vec![
            entry("res.partner", 1, RecordState::Imported, None),
            entry("res.partner", 2, RecordState::Imported, None),
            entry("res.partner", 3, RecordState::Failed, Some("远端校验拒绝: vat")),
            entry("product", 1, RecordState::Invalid, Some("name [REQUIRED_FIELD_MISSING]: 必填")),
        ];
        let summary = RunSummary::build(&finished_run(), &entries);

        assert_eq!(summary.counters.total, 4);
        assert_eq!(summary.counters.created, 2);
        assert_eq!(summary.per_model["res.partner"].failed, 1);
        assert_eq!(summary.per_model["product"].invalid, 1);
        assert!((summary.success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(summary.duration_secs, Some(125));
        assert_eq!(summary.top_errors.len(), 2);
    }

    #[test]
    fn test_top_errors_sorted_and_limited() {
        let mut entries = Vec::new();
        for row in 0..3 {
            entries.push(entry("m", row, RecordState::Failed, Some("timeout")));
        }
        entries.push(entry("m", 10, RecordState::Failed, Some("rejected")));
        entries.push(entry("m", 11, RecordState::DuplicateSkipped, Some("dup")));

        let errors = top_errors(&entries, 1);
        assert_eq!(errors, vec![ErrorCount { message: "timeout".into(), count: 3 }]);
    }

    #[test]
    fn test_render_in_both_locales() {
        let entries = vec![entry("res.partner", 1, RecordState::Imported, None)];
        let summary = RunSummary::build(&finished_run(), &entries);

        let en = summary.render("en");
        assert!(en.contains("Total records: 1"));
        assert!(en.contains("Duration: 2m 5s"));
        assert!(en.contains("Success rate: 100.0%"));

        let zh = summary.render("zh-CN");
        assert!(zh.contains("记录总数: 1"));
        assert!(zh.contains("COMPLETED"));
    }

    #[test]
    fn test_empty_run_has_zero_rate() {
        let summary = RunSummary::build(&finished_run(), &[]);
        assert_eq!(summary.success_rate, 0.0);
        assert!(summary.render("en").contains("Total records: 0"));
    }
}
