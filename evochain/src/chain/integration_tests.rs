//! End-to-end runs against a scripted service and real temp directories.

use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{StageOrchestrator, StagePhase};
use crate::client::RemoteGenerationClient;
use crate::config::{ChainConfig, GapPolicy};
use crate::errors::{ChainError, PreconditionError, RemoteError, RemoteOperation};
use crate::events::{names, CollectingEventSink};
use crate::jobs::JobId;
use crate::ledger::{JobOutcome, JobPhase, ResultLedger};
use crate::testing::{ImageTree, ScriptedService};

fn config(root: &Path) -> ChainConfig {
    ChainConfig::new(root)
        .with_startup_offset(0.0)
        .with_retries(2, 0.0)
        .with_stage_pause(0.0)
        .with_prompt_template("Evolve: [DESCRIPTION]")
}

fn orchestrator(
    config: ChainConfig,
    service: &Arc<ScriptedService>,
) -> (StageOrchestrator, Arc<CollectingEventSink>) {
    let client = Arc::new(RemoteGenerationClient::new(service.clone(), config.retry_policy()));
    let events = Arc::new(CollectingEventSink::new());
    (StageOrchestrator::new(config, client, events.clone()), events)
}

fn fail_nth_analysis(n: usize) -> impl Fn(&Path) -> bool + Send + Sync + 'static {
    let counter = AtomicUsize::new(0);
    move |_: &Path| counter.fetch_add(1, Ordering::SeqCst) == n
}

#[tokio::test]
async fn test_batch_four_images_two_workers() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    ImageTree::create(input.path(), &["a.png", "b.png", "c.png", "d.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().with_latency(Duration::from_millis(10)));
    let (orchestrator, _) = orchestrator(config(input.path()).with_worker_count(2), &service);
    let report = orchestrator.run_batch(input.path(), output.path()).await.unwrap();

    let results = report.ledger.stage_results(0);
    assert_eq!(results.len(), 4);
    let by_worker = |w: usize| -> Vec<usize> {
        results.iter().filter(|r| r.worker == w).map(|r| r.index).collect()
    };
    assert_eq!(by_worker(0), vec![0, 2]);
    assert_eq!(by_worker(1), vec![1, 3]);
    assert!(results.iter().all(|r| r.outcome == JobOutcome::Succeeded));
    assert_eq!(ImageTree::files_under(output.path()).len(), 4);
}

#[tokio::test]
async fn test_single_stage_chain_attributes_results_by_identity() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["a.png", "b.png", "c.png", "d.png"]).unwrap();

    let service = Arc::new(
        ScriptedService::new()
            .with_analyze_script("a.png", vec![Ok("slow first".to_string())])
            .with_latency(Duration::from_millis(5)),
    );
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 1), &service);
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.executed_stages(), vec![1]);
    let a = report.ledger.get(1, &JobId::new("", "a")).unwrap();
    assert_eq!((a.index, a.worker), (0, 0));
    let d = report.ledger.get(1, &JobId::new("", "d")).unwrap();
    assert_eq!((d.index, d.worker), (3, 1));

    let written = std::fs::read_to_string(a.output_path.as_ref().unwrap()).unwrap();
    assert_eq!(written, "Evolve: slow first");
}

#[tokio::test]
async fn test_chain_mirrors_nesting_and_keeps_identity() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["animals/dog.png", "fruit/apple.jpg"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 3), &service);
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.executed_stages(), vec![1, 2, 3]);
    assert_eq!(report.summary().succeeded, 6);
    assert_eq!(report.halted_after, None);

    let dog = JobId::new("animals", "dog");
    for stage in 1..=3 {
        let result = report.ledger.get(stage, &dog).unwrap();
        let output = result.output_path.as_ref().unwrap();
        assert_eq!(output.parent().unwrap(), root.path().join(stage.to_string()).join("animals"));
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dog_generated_"), "{name}");
        assert_eq!(name.matches("_generated_").count(), 1);
    }

    let stage3_source = &report.ledger.get(3, &dog).unwrap().source;
    assert!(stage3_source.starts_with(root.path().join("2")));

    // Stage directories are never re-ingested as categories.
    assert_eq!(report.stage(1).unwrap().total, 2);
    assert_eq!(service.analyzed_paths().len(), 6);
}

#[tokio::test]
async fn test_failed_stage_halts_chain() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["apple.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().fail_analyze_when(fail_nth_analysis(1)));
    let (orchestrator, events) = orchestrator(
        config(root.path()).with_stages(1, 3).with_gap_policy(GapPolicy::Halt),
        &service,
    );
    let report = orchestrator.run().await.unwrap();

    let apple = JobId::new("", "apple");
    assert_eq!(report.ledger.get(1, &apple).unwrap().outcome, JobOutcome::Succeeded);

    let failed = report.ledger.get(2, &apple).unwrap();
    assert_eq!(failed.outcome, JobOutcome::Failed);
    assert_eq!(failed.attempts.analyze, 1);
    let failure = failed.error.as_ref().unwrap();
    assert_eq!(failure.phase, JobPhase::Analyze);
    assert!(!failure.retryable);

    assert!(report.ledger.get(3, &apple).is_none());
    assert_eq!(report.executed_stages(), vec![1, 2]);
    assert_eq!(report.halted_after, Some(2));
    assert_eq!(events.events_of_type(names::CHAIN_HALTED).len(), 1);
    assert_eq!(service.analyzed_paths().len(), 2);
}

#[tokio::test]
async fn test_failed_stage_carries_forward_last_good_file() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["apple.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().fail_analyze_when(fail_nth_analysis(1)));
    let (orchestrator, _) = orchestrator(
        config(root.path()).with_stages(1, 3).with_gap_policy(GapPolicy::CarryForward),
        &service,
    );
    let report = orchestrator.run().await.unwrap();

    let apple = JobId::new("", "apple");
    let stage1 = report.ledger.get(1, &apple).unwrap();
    let stage2 = report.ledger.get(2, &apple).unwrap();
    let stage3 = report.ledger.get(3, &apple).unwrap();

    assert_eq!(stage2.outcome, JobOutcome::Failed);
    assert_eq!(stage2.attempts.total(), 1);
    assert_eq!(stage3.outcome, JobOutcome::Succeeded);
    assert_eq!(Some(&stage3.source), stage1.output_path.as_ref());
    assert!(stage3.source.starts_with(root.path().join("1")));
    assert_eq!(report.stage(3).unwrap().carried_forward, 1);
    assert_eq!(report.halted_after, None);
}

#[tokio::test]
async fn test_partial_failure_drops_only_failed_files() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["good.png", "bad.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().fail_analyze_when(|p: &Path| {
        p.file_name().is_some_and(|n| n.to_string_lossy() == "bad.png")
    }));
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 2), &service);
    let report = orchestrator.run().await.unwrap();

    let stage1 = report.stage(1).unwrap();
    assert_eq!((stage1.succeeded, stage1.failed), (1, 1));
    let stage2 = report.stage(2).unwrap();
    assert_eq!((stage2.total, stage2.succeeded), (1, 1));
    assert!(report.ledger.get(2, &JobId::new("", "bad")).is_none());
}

#[tokio::test]
async fn test_next_stage_ignores_outputs_from_earlier_runs() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["good.png", "bad.png"]).unwrap();
    let stale = ImageTree::create(root.path().join("1"), &["bad_generated_20240101_000000.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().fail_analyze_when(|p: &Path| {
        p.file_name().is_some_and(|n| n.to_string_lossy() == "bad.png")
    }));
    let (orchestrator, _) = orchestrator(
        config(root.path()).with_stages(1, 2).with_gap_policy(GapPolicy::Halt),
        &service,
    );
    let report = orchestrator.run().await.unwrap();

    let bad = JobId::new("", "bad");
    assert_eq!(report.ledger.get(1, &bad).unwrap().outcome, JobOutcome::Failed);
    assert!(report.ledger.get(2, &bad).is_none());
    assert_eq!(report.stage(2).unwrap().total, 1);
    assert_eq!(report.halted_after, None);

    let good = report.ledger.get(2, &JobId::new("", "good")).unwrap();
    assert_eq!(good.outcome, JobOutcome::Succeeded);
    assert_eq!(Some(&good.source), report.ledger.get(1, &JobId::new("", "good")).unwrap().output_path.as_ref());
    assert!(!service.analyzed_paths().iter().any(|p| p.starts_with(stale.root())));
}

#[tokio::test]
async fn test_carry_forward_uses_this_runs_file_not_a_stale_output() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["good.png", "bad.png"]).unwrap();
    ImageTree::create(root.path().join("1"), &["bad_generated_20240101_000000.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().fail_analyze_when(|p: &Path| {
        p.file_name().is_some_and(|n| n.to_string_lossy() == "bad.png")
    }));
    let (orchestrator, _) = orchestrator(
        config(root.path()).with_stages(1, 2).with_gap_policy(GapPolicy::CarryForward),
        &service,
    );
    let report = orchestrator.run().await.unwrap();

    let stage2 = report.ledger.get(2, &JobId::new("", "bad")).unwrap();
    assert_eq!(stage2.source, root.path().join("bad.png"));
    assert_eq!(stage2.outcome, JobOutcome::Failed);
    assert_eq!(report.stage(2).unwrap().carried_forward, 1);
}

#[tokio::test]
async fn test_inputs_sharing_a_stem_are_a_precondition_error() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["dog.png", "dog.jpg"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, events) = orchestrator(config(root.path()).with_stages(1, 1), &service);
    let err = orchestrator.run().await.unwrap_err();

    assert!(err.is_precondition());
    assert!(matches!(
        err,
        ChainError::Precondition(PreconditionError::DuplicateIdentity { stage: 1, ref job, .. }) if *job == JobId::new("", "dog")
    ));
    assert!(service.calls().is_empty());
    assert!(events.events_of_type(names::STAGE_STARTED).is_empty());
}

#[tokio::test]
async fn test_resume_skips_earlier_stages() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["apple.png"]).unwrap();
    let tree = ImageTree::create(root.path().join("2"), &["pear_generated_20250101_120000.png"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(3, 4), &service);
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.executed_stages(), vec![3, 4]);
    let analyzed = service.analyzed_paths();
    assert_eq!(analyzed.len(), 2);
    assert!(analyzed[0].starts_with(tree.root()));
    assert!(analyzed[1].starts_with(root.path().join("3")));
    assert!(!root.path().join("1").exists());
    assert!(report.ledger.get(3, &JobId::new("", "apple")).is_none());
    assert!(report.ledger.get(4, &JobId::new("", "pear")).is_some());
}

#[tokio::test]
async fn test_resume_without_previous_stage_is_a_precondition_error() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["apple.png"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, events) = orchestrator(config(root.path()).with_stages(3, 4), &service);
    let err = orchestrator.run().await.unwrap_err();

    assert!(err.is_precondition());
    assert!(matches!(
        err,
        ChainError::Precondition(PreconditionError::MissingInputRoot { stage: 3, ref path }) if *path == root.path().join("2")
    ));
    assert!(service.calls().is_empty());
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_empty_source_is_a_precondition_error() {
    let root = tempfile::tempdir().unwrap();
    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 2), &service);

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, ChainError::Precondition(PreconditionError::EmptyJobSet { stage: 1, .. })));
}

#[tokio::test]
async fn test_workers_start_staggered() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["a.png", "b.png", "c.png"]).unwrap();

    let offset = Duration::from_millis(150);
    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(
        config(root.path()).with_stages(1, 1).with_worker_count(3).with_startup_offset(0.15),
        &service,
    );

    let started = Instant::now();
    orchestrator.run().await.unwrap();

    let first_call = |name: &str| {
        service
            .calls_of(RemoteOperation::Analyze)
            .into_iter()
            .find(|c| c.subject.ends_with(name))
            .unwrap()
            .at
    };
    assert!(first_call("b.png").duration_since(started) >= offset);
    assert!(first_call("c.png").duration_since(started) >= offset * 2);
}

#[tokio::test]
async fn test_transient_failures_retried_up_to_bound() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["kiwi.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().with_analyze_script(
        "kiwi",
        vec![
            Err(RemoteError::transient(RemoteOperation::Analyze, "HTTP 429")),
            Err(RemoteError::transient(RemoteOperation::Analyze, "HTTP 503")),
            Ok("a kiwi".to_string()),
        ],
    ));
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 1).with_retries(2, 0.0), &service);
    let report = orchestrator.run().await.unwrap();

    let kiwi = report.ledger.get(1, &JobId::new("", "kiwi")).unwrap();
    assert_eq!(kiwi.outcome, JobOutcome::Succeeded);
    assert_eq!(kiwi.attempts.analyze, 3);
    assert_eq!(service.calls_of(RemoteOperation::Analyze).len(), 3);
    assert_eq!(service.calls_of(RemoteOperation::Synthesize).len(), 1);
}

#[tokio::test]
async fn test_rerun_never_overwrites_outputs() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    ImageTree::create(input.path(), &["plum.png"]).unwrap();

    let service = Arc::new(ScriptedService::new().with_synthesize_script(
        "plum",
        vec![
            Ok(crate::client::GeneratedImage::png(b"first".to_vec())),
            Ok(crate::client::GeneratedImage::png(b"second".to_vec())),
        ],
    ));
    let (orchestrator, _) = orchestrator(config(input.path()), &service);

    let first = orchestrator.run_batch(input.path(), output.path()).await.unwrap();
    let second = orchestrator.run_batch(input.path(), output.path()).await.unwrap();

    let first_path: PathBuf = first.ledger.stage_results(0)[0].output_path.clone().unwrap();
    let second_path: PathBuf = second.ledger.stage_results(0)[0].output_path.clone().unwrap();
    assert_ne!(first_path, second_path);
    assert_eq!(std::fs::read(&first_path).unwrap(), b"first");
    assert_eq!(std::fs::read(&second_path).unwrap(), b"second");
    assert_eq!(ImageTree::files_under(output.path()).len(), 2);
}

#[tokio::test]
async fn test_skip_existing_reuses_outputs() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["fig.png"]).unwrap();
    ImageTree::create(root.path().join("1"), &["fig_generated_20240101_000000.png"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(
        config(root.path()).with_stages(1, 2).with_skip_existing(true),
        &service,
    );
    let report = orchestrator.run().await.unwrap();

    let fig = JobId::new("", "fig");
    assert_eq!(report.ledger.get(1, &fig).unwrap().outcome, JobOutcome::Skipped);
    assert_eq!(report.ledger.get(2, &fig).unwrap().outcome, JobOutcome::Succeeded);
    assert_eq!(service.analyzed_paths().len(), 1);
}

#[tokio::test]
async fn test_advance_step_by_step() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["lime.png"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, _) = orchestrator(config(root.path()).with_stages(1, 2), &service);
    let mut ledger = ResultLedger::new();

    let state = orchestrator.initial_state().unwrap();
    assert_eq!((state.stage(), state.phase()), (1, StagePhase::Pending));

    let (state, report) = orchestrator.advance(state, &mut ledger).await.unwrap();
    assert_eq!((state.stage(), state.phase()), (1, StagePhase::Complete));
    assert_eq!(report.ordinal, 1);
    assert_eq!(ledger.len(), 1);

    let (state, report) = orchestrator.advance(state, &mut ledger).await.unwrap();
    assert_eq!((state.stage(), state.phase()), (2, StagePhase::Complete));
    assert_eq!(report.ordinal, 2);
    assert!(state.is_finished());

    let err = orchestrator.advance(state, &mut ledger).await.unwrap_err();
    assert!(matches!(err, ChainError::ChainFinished));
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let root = tempfile::tempdir().unwrap();
    ImageTree::create(root.path(), &["a.png", "b.png"]).unwrap();

    let service = Arc::new(ScriptedService::new());
    let (orchestrator, events) = orchestrator(config(root.path()).with_stages(1, 2), &service);
    orchestrator.run().await.unwrap();

    let types = events.event_types();
    assert_eq!(types.first().map(String::as_str), Some(names::CHAIN_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(names::CHAIN_COMPLETED));
    assert_eq!(events.events_of_type(names::STAGE_STARTED).len(), 2);
    assert_eq!(events.events_of_type(names::STAGE_COMPLETED).len(), 2);
    assert_eq!(events.events_of_type(names::JOB_COMPLETED).len(), 4);
}
