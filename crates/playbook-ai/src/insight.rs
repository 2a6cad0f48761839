//! Run analysis: confidence, anomalies, risk and summaries.
//!
//! Everything here is a pure function of run and step state plus the current
//! time, so dashboards and the orchestrator can call it freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use playbook_types::{
    Id, PlaybookRun, RiskLevel, RunProgress, RunStatus, StepExecution, StepStatus, Timestamp,
};

/// Confidence below this is treated as a risk factor.
const LOW_CONFIDENCE: f64 = 0.6;

/// A completed step slower than this multiple of the median is anomalous.
const SLOW_FACTOR: f64 = 2.0;

/// Minimum number of completed steps before durations are compared.
const MIN_DURATION_SAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The step needed at least one retry.
    Retried { attempts: u32 },
    /// Completed, but took far longer than its peers.
    SlowExecution { duration_secs: i64, median_secs: i64 },
    /// Still open after its due date.
    Overdue { due_at: Timestamp },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub step_id: Id,
    pub step_name: String,
    #[serde(flatten)]
    pub kind: AnomalyKind,
}

impl Anomaly {
    pub fn describe(&self) -> String {
        match &self.kind {
            AnomalyKind::Retried { attempts } => {
                format!("step '{}' failed {} time(s) before this attempt", self.step_name, attempts)
            }
            AnomalyKind::SlowExecution {
                duration_secs,
                median_secs,
            } => format!(
                "step '{}' took {}s against a median of {}s",
                self.step_name, duration_secs, median_secs
            ),
            AnomalyKind::Overdue { due_at } => {
                format!("step '{}' is overdue since {}", self.step_name, due_at.to_rfc3339())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Additive score; 30 and above is medium, 60 and above high.
    pub score: u32,
    pub factors: Vec<String>,
}

/// Stateless analysis over runs and their steps.
#[derive(Debug, Clone)]
pub struct InsightService {
    default_confidence: f64,
}

impl Default for InsightService {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl InsightService {
    pub fn new(default_confidence: f64) -> Self {
        Self {
            default_confidence: default_confidence.clamp(0.0, 1.0),
        }
    }

    /// Confidence for one step's outputs.
    ///
    /// A backend-reported value wins. Otherwise empty outputs score zero and
    /// anything else gets the default confidence.
    pub fn confidence(&self, outputs: &Value, reported: Option<f64>) -> f64 {
        if let Some(c) = reported {
            return c.clamp(0.0, 1.0);
        }
        let empty = match outputs {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if empty { 0.0 } else { self.default_confidence }
    }

    /// Mean confidence over the steps that recorded one.
    pub fn run_confidence(&self, steps: &[StepExecution]) -> Option<f64> {
        let scores: Vec<f64> = steps.iter().filter_map(|s| s.ai_confidence).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    pub fn detect_anomalies(&self, steps: &[StepExecution], now: Timestamp) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for step in steps.iter().filter(|s| s.attempt > 0) {
            anomalies.push(anomaly(step, AnomalyKind::Retried {
                attempts: step.attempt,
            }));
        }

        let durations: Vec<(&StepExecution, i64)> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| match (s.started_at, s.completed_at) {
                (Some(start), Some(end)) => Some((s, (end - start).num_seconds())),
                _ => None,
            })
            .collect();
        if durations.len() >= MIN_DURATION_SAMPLES {
            let median = median(durations.iter().map(|(_, d)| *d).collect());
            if median > 0 {
                for (step, duration) in &durations {
                    if *duration as f64 > SLOW_FACTOR * median as f64 {
                        anomalies.push(anomaly(step, AnomalyKind::SlowExecution {
                            duration_secs: *duration,
                            median_secs: median,
                        }));
                    }
                }
            }
        }

        for step in steps.iter().filter(|s| !s.status.is_terminal()) {
            if let Some(due_at) = step.due_at
                && due_at < now
            {
                anomalies.push(anomaly(step, AnomalyKind::Overdue { due_at }));
            }
        }

        anomalies
    }

    pub fn assess_risk(
        &self,
        run: &PlaybookRun,
        steps: &[StepExecution],
        now: Timestamp,
    ) -> RiskAssessment {
        let mut score = 0u32;
        let mut factors = Vec::new();

        let progress = RunProgress::from_steps(steps);
        if progress.failed_steps > 0 {
            score += (30 * progress.failed_steps).min(60);
            factors.push(format!("{} failed step(s)", progress.failed_steps));
        }
        if run.status == RunStatus::Blocked {
            score += 25;
            factors.push("run is blocked".to_string());
        }
        if !run.validation_errors.is_empty() {
            score += 20;
            factors.push(format!(
                "{} contract validation error(s)",
                run.validation_errors.len()
            ));
        }
        if let Some(confidence) = self.run_confidence(steps)
            && confidence < LOW_CONFIDENCE
        {
            score += 20;
            factors.push(format!("low AI confidence ({confidence:.2})"));
        }
        let anomalies = self.detect_anomalies(steps, now);
        if !anomalies.is_empty() {
            score += (10 * anomalies.len() as u32).min(30);
            factors.extend(anomalies.iter().map(Anomaly::describe));
        }

        let level = if score >= 60 {
            RiskLevel::High
        } else if score >= 30 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        RiskAssessment {
            level,
            score,
            factors,
        }
    }

    /// One-paragraph human-readable status of a run.
    pub fn summarize(&self, run: &PlaybookRun, steps: &[StepExecution], now: Timestamp) -> String {
        let progress = RunProgress::from_steps(steps);
        let mut summary = format!(
            "Run {} is {}: {}/{} steps completed, {} failed, {} skipped.",
            run.id,
            run.status,
            progress.completed_steps,
            progress.total_steps,
            progress.failed_steps,
            progress.skipped_steps
        );
        if let Some(confidence) = self.run_confidence(steps) {
            summary.push_str(&format!(" Average AI confidence {confidence:.2}."));
        }
        let risk = self.assess_risk(run, steps, now);
        summary.push_str(&format!(" Risk is {}", risk.level));
        if risk.factors.is_empty() {
            summary.push('.');
        } else {
            summary.push_str(&format!(": {}.", risk.factors.join("; ")));
        }
        summary
    }

    /// Insight lines stored on a run when it finishes.
    pub fn run_insights(&self, run: &PlaybookRun, steps: &[StepExecution], now: Timestamp) -> Vec<String> {
        let mut insights: Vec<String> = steps
            .iter()
            .filter_map(|s| s.ai_insights.clone())
            .collect();
        insights.extend(
            self.detect_anomalies(steps, now)
                .iter()
                .map(Anomaly::describe),
        );
        if insights.is_empty() {
            insights.push(self.summarize(run, steps, now));
        }
        insights
    }
}

fn anomaly(step: &StepExecution, kind: AnomalyKind) -> Anomaly {
    Anomaly {
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        kind,
    }
}

fn median(mut values: Vec<i64>) -> i64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use playbook_types::{Priority, StepType, WorkerType, now};
    use serde_json::json;

    fn step(name: &str, status: StepStatus) -> StepExecution {
        StepExecution {
            id: format!("id-{name}"),
            organization_id: "org".into(),
            run_id: "run".into(),
            step_id: format!("def-{name}"),
            sequence: 1,
            name: name.into(),
            worker_type: WorkerType::System,
            step_type: StepType::Standard,
            status,
            attempt: 0,
            inputs: Value::Null,
            outputs: None,
            error: None,
            priority: Priority::Normal,
            critical: false,
            depends_on: vec![],
            required_signals: vec![],
            received_signals: vec![],
            sla_seconds: 3600,
            started_at: None,
            completed_at: None,
            due_at: None,
            retry_scheduled_at: None,
            earliest_start_time: None,
            paused_at: None,
            ai_confidence: None,
            ai_insights: None,
            worker_id: None,
            assignee: None,
            latency_ms: None,
            claimed_by: None,
        }
    }

    fn timed(name: &str, secs: i64) -> StepExecution {
        let end = now();
        let mut s = step(name, StepStatus::Completed);
        s.started_at = Some(end - Duration::seconds(secs));
        s.completed_at = Some(end);
        s
    }

    fn run(status: RunStatus) -> PlaybookRun {
        serde_json::from_value(json!({
            "id": "run-1",
            "organization_id": "org",
            "playbook_id": "pb",
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn test_confidence_rules() {
        let service = InsightService::default();
        assert_eq!(service.confidence(&json!({"a": 1}), None), 0.85);
        assert_eq!(service.confidence(&json!({}), None), 0.0);
        assert_eq!(service.confidence(&json!({"a": 1}), Some(1.4)), 1.0);
    }

    #[test]
    fn test_detects_retries_and_overdue() {
        let service = InsightService::default();
        let mut retried = step("retried", StepStatus::Completed);
        retried.attempt = 2;
        let mut waiting = step("approval", StepStatus::WaitingInput);
        waiting.due_at = Some(now() - Duration::hours(1));

        let anomalies = service.detect_anomalies(&[retried, waiting], now());
        assert_eq!(anomalies.len(), 2);
        assert!(matches!(anomalies[0].kind, AnomalyKind::Retried { attempts: 2 }));
        assert!(matches!(anomalies[1].kind, AnomalyKind::Overdue { .. }));
    }

    #[test]
    fn test_detects_slow_step() {
        let service = InsightService::default();
        let steps = vec![timed("a", 10), timed("b", 12), timed("c", 11), timed("d", 60)];
        let anomalies = service.detect_anomalies(&steps, now());
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].step_name, "d");
    }

    #[test]
    fn test_risk_levels() {
        let service = InsightService::default();
        let healthy = service.assess_risk(&run(RunStatus::InProgress), &[timed("a", 5)], now());
        assert_eq!(healthy.level, RiskLevel::Low);
        assert!(healthy.factors.is_empty());

        let failed = vec![
            step("x", StepStatus::Failed),
            step("y", StepStatus::Failed),
        ];
        let risky = service.assess_risk(&run(RunStatus::Blocked), &failed, now());
        assert_eq!(risky.level, RiskLevel::High);
        assert!(risky.factors.iter().any(|f| f.contains("blocked")));
    }

    #[test]
    fn test_summary_mentions_progress() {
        let service = InsightService::default();
        let mut a = timed("a", 5);
        a.ai_confidence = Some(0.9);
        let summary = service.summarize(
            &run(RunStatus::InProgress),
            &[a, step("b", StepStatus::Pending)],
            now(),
        );
        assert!(summary.contains("1/2 steps completed"));
        assert!(summary.contains("0.90"));
        assert!(summary.contains("Risk is low"));
    }
}
