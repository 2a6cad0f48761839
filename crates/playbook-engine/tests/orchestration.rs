//! End-to-end orchestration over the in-memory store.
//!
//! Covers sequencing of parallel groups, retry scheduling, failure
//! propagation, human steps and the background poll loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{ScriptedWorker, orchestrator, publish, system_step};
use playbook_ai::{AiResponse, MockAiBackend};
use playbook_engine::{
    CompletionMeta, EngineError, Orchestrator, OrchestratorConfig, RunOptions, TransitionContext,
    WorkerOutcome, WorkerOutput,
};
use playbook_types::{EngineEvent, EntityKind, RetryPolicy, RunStatus, StepDefinition, StepStatus, WorkerType};

fn immediate_retries(max_attempts: u32) -> Option<RetryPolicy> {
    Some(RetryPolicy {
        max_attempts,
        backoff_seconds: vec![0; max_attempts as usize],
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequencing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_parallel_group_runs_between_neighbours() {
    let worker = ScriptedWorker::new(|dispatch, _| {
        Ok(WorkerOutcome::Completed(WorkerOutput::new(json!({
            (dispatch.step.name.clone()): true,
        }))))
    });
    let orchestrator = orchestrator(worker.clone());
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![
            system_step("intake", 1),
            system_step("credit", 2),
            system_step("fraud", 2),
            system_step("decide", 3),
        ],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    let pending: Vec<_> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(pending, vec!["intake"]);

    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress.completed_steps, 4);

    let calls = worker.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0], "intake");
    assert_eq!(calls[3], "decide");
    assert!(calls[1..3].contains(&"credit".to_string()));
    assert!(calls[1..3].contains(&"fraud".to_string()));
}

#[tokio::test]
async fn test_explicit_dependency_on_earlier_group() {
    let worker = ScriptedWorker::returning(json!({"ok": true}));
    let orchestrator = orchestrator(worker.clone());
    let mut notify = system_step("notify", 3);
    notify.depends_on = vec![1];
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![system_step("collect", 1), system_step("review", 2), notify],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(worker.calls(), vec!["collect", "review", "notify"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures and retries
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retryable_failure_is_retried_until_success() {
    let worker = ScriptedWorker::new(|_, previous| {
        if previous < 2 {
            Err(EngineError::worker("UPSTREAM_UNAVAILABLE", "service returned 503"))
        } else {
            Ok(WorkerOutcome::Completed(WorkerOutput::new(json!({"ok": true}))))
        }
    });
    let orchestrator = orchestrator(worker.clone());
    let mut flaky = system_step("flaky", 1);
    flaky.retry_policy = immediate_retries(3);
    let (playbook_id, _) = publish(&orchestrator, vec![flaky], json!({"type": "object"})).await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(worker.calls().len(), 3);

    let step = orchestrator.repo().run_steps(&run.id).await.unwrap().remove(0);
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempt, 2);
    assert!(step.error.is_none());
}

#[tokio::test]
async fn test_default_backoff_schedule_until_terminal() {
    let worker = ScriptedWorker::new(|_, _| Err(EngineError::worker("TIMEOUT", "gateway timeout")));
    let orchestrator = orchestrator(worker.clone());
    let (playbook_id, _) =
        publish(&orchestrator, vec![system_step("post", 1)], json!({"type": "object"})).await;
    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();

    // First failure comes from the worker; the 5s backoff keeps the step
    // out of the next poll.
    orchestrator.drain().await.unwrap();
    assert_eq!(worker.calls().len(), 1);
    let step = orchestrator.repo().run_steps(&run.id).await.unwrap().remove(0);
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.attempt, 1);
    let delay = step.retry_scheduled_at.unwrap() - playbook_types::now();
    assert!(delay > chrono::Duration::seconds(3) && delay <= chrono::Duration::seconds(5));

    let status = orchestrator
        .fail_step(&step.id, "TIMEOUT", "gateway timeout", true)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Pending);
    let step = orchestrator.repo().get_step_execution(&step.id).await.unwrap();
    assert_eq!(step.attempt, 2);
    let delay = step.retry_scheduled_at.unwrap() - playbook_types::now();
    assert!(delay > chrono::Duration::seconds(25) && delay <= chrono::Duration::seconds(30));

    let status = orchestrator
        .fail_step(&step.id, "TIMEOUT", "gateway timeout", true)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Failed);
    let step = orchestrator.repo().get_step_execution(&step.id).await.unwrap();
    assert_eq!(step.attempt, 3);
}

#[tokio::test]
async fn test_critical_step_exhausting_retries_fails_run() {
    let worker = ScriptedWorker::new(|_, _| Err(EngineError::worker("BUREAU_DOWN", "no response")));
    let orchestrator = orchestrator(worker.clone());
    let mut check = system_step("check", 1);
    check.critical = true;
    check.retry_policy = immediate_retries(2);
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![check, system_step("after", 2)],
        json!({"type": "object"}),
    )
    .await;
    let mut events = orchestrator.subscribe();

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("critical step 'check' failed"))
    );
    assert_eq!(worker.calls(), vec!["check", "check"]);

    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[0].error.as_ref().unwrap().code, "BUREAU_DOWN");
    assert_eq!(steps[1].status, StepStatus::Skipped);

    let mut failed_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::StepFailed { .. }) {
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 2);
}

#[tokio::test]
async fn test_critical_failure_skips_waiting_peer_in_same_group() {
    let worker = ScriptedWorker::new(|_, _| Err(EngineError::worker("BUREAU_DOWN", "no response")));
    let orchestrator = orchestrator(worker.clone());
    let mut check = system_step("check", 1);
    check.critical = true;
    check.retry_policy = immediate_retries(1);
    let mut peer = system_step("collect_docs", 1);
    peer.required_signals = vec!["docs_received".into()];
    let (playbook_id, _) =
        publish(&orchestrator, vec![check, peer], json!({"type": "object"})).await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("critical step 'check' failed"))
    );
    assert_eq!(worker.calls(), vec!["check"]);
    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    let status_of = |name: &str| {
        steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.status)
            .unwrap()
    };
    assert_eq!(status_of("check"), StepStatus::Failed);
    assert_eq!(status_of("collect_docs"), StepStatus::Skipped);
}

#[tokio::test]
async fn test_non_critical_failure_skips_rest_and_fails_run() {
    let worker = ScriptedWorker::new(|dispatch, _| {
        if dispatch.step.name == "enrich" {
            Err(EngineError::worker("ENRICH_FAILED", "bad payload"))
        } else {
            Ok(WorkerOutcome::Completed(WorkerOutput::new(json!({"ok": true}))))
        }
    });
    let orchestrator = orchestrator(worker.clone());
    let mut enrich = system_step("enrich", 2);
    enrich.retry_policy = immediate_retries(1);
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![system_step("load", 1), enrich, system_step("publish", 3)],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let run = orchestrator
        .run_until_settled(&run.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure_reason.as_deref(),
        Some("step 'enrich' failed: bad payload")
    );
    assert_eq!(worker.calls(), vec!["load", "enrich"]);

    let statuses: Vec<_> = orchestrator
        .repo()
        .run_steps(&run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Skipped]
    );
}

#[tokio::test]
async fn test_step_without_worker_is_refused() {
    let worker = ScriptedWorker::returning(json!({}));
    let orchestrator = orchestrator(worker);
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![StepDefinition::new("call", 1, WorkerType::External)],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let step = orchestrator.repo().run_steps(&run.id).await.unwrap().remove(0);
    let report = orchestrator.process_step(&step.id, None).await.unwrap();
    assert_eq!(report.status, StepStatus::Failed);
    // Refused at claim time by the worker_obtainable guard.
    let error = report.error.unwrap();
    assert_eq!(error.code, "TRANSITION_REJECTED");
    assert!(error.message.contains("worker registered"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Human steps and lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_human_step_waits_for_completion() {
    let worker = ScriptedWorker::returning(json!({"prepared": true}));
    let orchestrator = orchestrator(worker);
    let mut approve = StepDefinition::new("approve", 2, WorkerType::Human);
    approve.assignee = Some("finance_manager".into());
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![system_step("prepare", 1), approve],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    orchestrator.drain().await.unwrap();

    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    let approve = &steps[1];
    assert_eq!(approve.status, StepStatus::WaitingInput);
    let tasks = orchestrator.repo().human_tasks(&approve.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].metadata["assignee"], json!("finance_manager"));
    assert_eq!(
        orchestrator.repo().get_run(&run.id).await.unwrap().status,
        RunStatus::InProgress
    );

    let report = orchestrator
        .complete_step(
            &approve.id,
            json!({"approved": true}),
            CompletionMeta::by("finance_manager"),
        )
        .await
        .unwrap();
    assert_eq!(report.status, StepStatus::Completed);

    let run = orchestrator.repo().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outputs, Some(json!({"prepared": true, "approved": true})));
    let tasks = orchestrator.repo().human_tasks(&approve.id).await.unwrap();
    assert_eq!(tasks[0].metadata["status"], json!("completed"));

    let err = orchestrator
        .complete_step(&approve.id, json!({}), CompletionMeta::by("finance_manager"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSITION_NOT_ALLOWED");
}

#[tokio::test]
async fn test_system_ai_human_happy_path() {
    let worker = ScriptedWorker::returning(json!({"credit_score": 712}));
    let store: playbook_store::SharedStore = Arc::new(playbook_store::MemoryStore::new());
    let orchestrator = Orchestrator::builder()
        .with_store(store)
        .with_config(OrchestratorConfig {
            organization_id: common::ORG.into(),
            ..Default::default()
        })
        .with_worker(WorkerType::System, worker)
        .with_ai_backend(Arc::new(MockAiBackend::repeating(
            AiResponse::new(json!({"risk": "low"})).with_confidence(0.9),
        )))
        .build()
        .unwrap();
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![
            system_step("fetch_credit", 1),
            StepDefinition::new("assess", 2, WorkerType::Ai),
            StepDefinition::new("sign_off", 3, WorkerType::Human),
        ],
        json!({"type": "object"}),
    )
    .await;

    let run = orchestrator
        .start_run(&playbook_id, json!({"applicant": "a-1"}), RunOptions::default())
        .await
        .unwrap();
    orchestrator.drain().await.unwrap();

    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    assert_eq!(steps[1].outputs, Some(json!({"risk": "low"})));
    assert_eq!(steps[1].ai_confidence, Some(0.9));
    assert_eq!(steps[2].status, StepStatus::WaitingInput);
    // The AI step saw the system step's outputs.
    assert_eq!(steps[1].inputs["step_1"], json!({"credit_score": 712}));
    assert_eq!(steps[1].inputs["applicant"], json!("a-1"));

    orchestrator
        .complete_step(&steps[2].id, json!({"signed": true}), CompletionMeta::by("officer"))
        .await
        .unwrap();
    let run = orchestrator.repo().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.progress.completed_steps, 3);
    assert_eq!(run.progress.failed_steps, 0);
    assert!(run.ai_confidence.is_some());

    let history: Vec<String> = orchestrator
        .machine()
        .history(EntityKind::Run, &run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.to_state)
        .collect();
    assert_eq!(history, vec!["in_progress", "completed"]);
}

#[tokio::test]
async fn test_forced_archive_cancels_waiting_run() {
    let worker = ScriptedWorker::returning(json!({}));
    let orchestrator = orchestrator(worker);
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![
            StepDefinition::new("sign", 1, WorkerType::Human),
            system_step("file", 2),
        ],
        json!({"type": "object"}),
    )
    .await;
    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    orchestrator.drain().await.unwrap();

    let record = orchestrator
        .machine()
        .transition(
            EntityKind::Playbook,
            &playbook_id,
            "archived",
            TransitionContext::new().by("admin").forced(),
        )
        .await
        .unwrap();
    assert_eq!(record.warnings.len(), 1);

    let run = orchestrator.repo().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Skipped));

    let err = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSITION_NOT_ALLOWED");
}

#[tokio::test]
async fn test_background_loop_completes_run() {
    let worker = ScriptedWorker::returning(json!({"done": true}));
    let orchestrator = common::orchestrator(worker);
    let (playbook_id, _) = publish(
        &orchestrator,
        vec![system_step("one", 1), system_step("two", 2)],
        json!({"type": "object", "required": ["done"]}),
    )
    .await;
    let mut events = orchestrator.subscribe();
    orchestrator.start();

    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::RunCompleted { run_id }) if run_id == run.id => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    orchestrator.stop().await;

    assert!(completed);
    let run = orchestrator.repo().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.outputs, Some(json!({"done": true})));
}

// ─────────────────────────────────────────────────────────────────────────────
// Time offsets
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unrepresentable_sla_blocks_publish() {
    let orchestrator = orchestrator(ScriptedWorker::returning(json!({})));
    let repo = orchestrator.repo();
    let playbook = repo
        .create_playbook(common::ORG, "PB-SLA", "Huge SLA", "")
        .await
        .unwrap();
    repo.set_contract(&playbook.id, playbook_contracts::INPUT_CONTRACT, json!({"type": "object"}))
        .await
        .unwrap();
    repo.set_contract(&playbook.id, playbook_contracts::OUTPUT_CONTRACT, json!({"type": "object"}))
        .await
        .unwrap();
    let mut step = system_step("slow", 1);
    step.sla_seconds = u64::MAX;
    repo.add_step(&playbook.id, step).await.unwrap();

    let decision = orchestrator
        .machine()
        .can_transition(
            EntityKind::Playbook,
            &playbook.id,
            "published",
            &TransitionContext::new(),
        )
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert!(
        decision
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("out-of-range sla_seconds"))
    );
}

#[tokio::test]
async fn test_unrepresentable_sla_fails_step_without_dispatch() {
    let worker = ScriptedWorker::returning(json!({}));
    let orchestrator = orchestrator(worker.clone());
    let (playbook_id, _) =
        publish(&orchestrator, vec![system_step("slow", 1)], json!({"type": "object"})).await;
    let run = orchestrator
        .start_run(&playbook_id, json!({}), RunOptions::default())
        .await
        .unwrap();
    let step = orchestrator.repo().run_steps(&run.id).await.unwrap().remove(0);
    let patch = json!({"sla_seconds": 10_000_000_000_000u64});
    orchestrator
        .repo()
        .update_step_execution(&step.id, patch.as_object().cloned().unwrap())
        .await
        .unwrap();

    let report = orchestrator.process_step(&step.id, None).await.unwrap();

    assert_eq!(report.status, StepStatus::Failed);
    assert_eq!(report.error.as_ref().unwrap().code, "INVALID_DEFINITION");
    assert!(worker.calls().is_empty());
    let run = orchestrator.repo().get_run(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}
