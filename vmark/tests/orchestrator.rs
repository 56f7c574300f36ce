use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vmark::AppConfig;
use vmark::discovery::{Item, ItemClass, Recipient, classify};
use vmark::pipeline::{ItemProcessor, PipelineOrchestrator, RecipientOutcome, ResultSink};
use vmark::state::StateStore;

/// Records every call; items listed in `hang` never finish, items in `fail` report failure,
/// items in `flaky` fail only on their first attempt.
#[derive(Default)]
struct ScriptedProcessor {
    calls: Mutex<Vec<(String, String)>>,
    hang: Vec<&'static str>,
    fail: Vec<(&'static str, &'static str)>,
    flaky: Vec<&'static str>,
}

impl ScriptedProcessor {
    fn calls_for(&self, recipient: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn prepare(&self, _recipient: &Recipient) -> vmark::Result<()> {
        Ok(())
    }

    async fn process(&self, recipient: &Recipient, item: &Item) -> bool {
        let attempts = {
            let mut calls = self.calls.lock();
            calls.push((recipient.name.clone(), item.id.clone()));
            calls
                .iter()
                .filter(|(r, id)| *r == recipient.name && *id == item.id)
                .count()
        };
        if self.hang.iter().any(|id| *id == item.id) {
            std::future::pending::<()>().await;
        }
        if attempts == 1 && self.flaky.iter().any(|id| *id == item.id) {
            return false;
        }
        !self
            .fail
            .iter()
            .any(|(r, id)| *r == recipient.name && *id == item.id)
    }
}

fn items(step: u32) -> Vec<Item> {
    let mut config = AppConfig::default();
    config.watermark.step = step;
    classify(
        vec![
            PathBuf::from("src/v1.mp4"),
            PathBuf::from("src/v2.mp4"),
            PathBuf::from("src/v3.mp4"),
        ],
        &config,
    )
}

fn progress(state_dir: &std::path::Path) -> BTreeMap<String, Vec<String>> {
    let json = std::fs::read_to_string(state_dir.join("progress.json")).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn step_two_classifies_alternate_items() {
    let items = items(2);
    let classes: Vec<_> = items.iter().map(|i| (i.id.as_str(), i.class)).collect();
    assert_eq!(
        classes,
        vec![
            ("v1", ItemClass::InvisibleMark),
            ("v2", ItemClass::PlainMark),
            ("v3", ItemClass::InvisibleMark),
        ]
    );
}

#[tokio::test]
async fn interrupted_run_resumes_with_remaining_items() {
    let dir = tempfile::tempdir().unwrap();
    let items = items(2);
    let recipients = vec![Recipient::new("A")];

    // First run: v1 completes, then v3 hangs and the run is abandoned.
    let state = Arc::new(StateStore::new(dir.path()));
    let crashing = Arc::new(ScriptedProcessor {
        hang: vec!["v3"],
        ..Default::default()
    });
    let orchestrator = PipelineOrchestrator::new(state, crashing.clone());
    let abandoned =
        tokio::time::timeout(Duration::from_millis(300), orchestrator.run(&recipients, &items))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(crashing.calls_for("A"), vec!["v1", "v3"]);

    let mut expected = BTreeMap::new();
    expected.insert("A".to_string(), vec!["v1".to_string()]);
    assert_eq!(progress(dir.path()), expected);

    // Second run with a fresh store over the same files.
    let state = Arc::new(StateStore::new(dir.path()));
    let processor = Arc::new(ScriptedProcessor::default());
    let report = PipelineOrchestrator::new(state.clone(), processor.clone())
        .run(&recipients, &items)
        .await;

    let mut calls = processor.calls_for("A");
    calls.sort();
    assert_eq!(calls, vec!["v2", "v3"]);
    assert_eq!(report.recipients[0].outcome, RecipientOutcome::Finished);
    assert_eq!(
        progress(dir.path())["A"],
        vec!["v1".to_string(), "v2".to_string(), "v3".to_string()]
    );
    assert!(state.is_finished("A").await.unwrap());

    // Third run: nothing left to do.
    let idle = Arc::new(ScriptedProcessor::default());
    let report = PipelineOrchestrator::new(state, idle.clone())
        .run(&recipients, &items)
        .await;
    assert!(idle.calls.lock().is_empty());
    assert_eq!(report.recipients[0].outcome, RecipientOutcome::Skipped);
    assert_eq!(report.skipped(), 1);
}

#[tokio::test]
async fn failed_item_only_affects_its_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let items = items(2);
    let state = Arc::new(StateStore::new(dir.path()));
    let processor = Arc::new(ScriptedProcessor {
        fail: vec![("A", "v2")],
        ..Default::default()
    });

    let report = PipelineOrchestrator::new(state.clone(), processor.clone())
        .run(&[Recipient::new("A"), Recipient::new("B")], &items)
        .await;

    assert_eq!(report.recipients[0].outcome, RecipientOutcome::Incomplete);
    assert_eq!(report.recipients[0].failed, vec!["v2".to_string()]);
    assert_eq!(report.recipients[1].outcome, RecipientOutcome::Finished);
    assert_eq!(report.processed(), 5);
    assert_eq!(report.failed(), 1);

    assert!(!state.is_finished("A").await.unwrap());
    assert!(state.is_finished("B").await.unwrap());
    assert_eq!(
        state
            .pending("A", &["v1".to_string(), "v2".to_string(), "v3".to_string()])
            .await
            .unwrap(),
        vec!["v2".to_string()]
    );
}

#[tokio::test]
async fn missed_items_are_retried_within_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::new(dir.path()));
    let processor = Arc::new(ScriptedProcessor {
        flaky: vec!["v2"],
        fail: vec![("B", "v3")],
        ..Default::default()
    });

    let report = PipelineOrchestrator::new(state.clone(), processor.clone())
        .with_retry_missed(true)
        .run(&[Recipient::new("A"), Recipient::new("B")], &items(2))
        .await;

    // v2 fails once for each recipient, then succeeds on the retry pass.
    assert_eq!(processor.calls_for("A"), vec!["v1", "v3", "v2", "v2"]);
    assert_eq!(report.recipients[0].outcome, RecipientOutcome::Finished);
    assert!(report.recipients[0].failed.is_empty());
    assert!(state.is_finished("A").await.unwrap());

    // B's v3 keeps failing and stays pending for the next run.
    assert_eq!(report.recipients[1].outcome, RecipientOutcome::Incomplete);
    assert_eq!(report.recipients[1].failed, vec!["v3".to_string()]);
    assert!(!state.is_finished("B").await.unwrap());
    assert_eq!(report.processed(), 5);
}

#[derive(Default)]
struct CollectingSink {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn deliver(&self, recipient: &Recipient, item: &Item) -> vmark::Result<bool> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.delivered
            .lock()
            .push(format!("{}/{}", recipient.name, item.id));
        Ok(item.id != "v3")
    }
}

#[tokio::test]
async fn deliveries_are_joined_before_run_returns() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateStore::new(dir.path()));
    let sink = Arc::new(CollectingSink::default());

    let report = PipelineOrchestrator::new(state, Arc::new(ScriptedProcessor::default()))
        .with_sink(sink.clone())
        .run(&[Recipient::new("A")], &items(1))
        .await;

    let mut delivered = sink.delivered.lock().clone();
    delivered.sort();
    assert_eq!(delivered, vec!["A/v1", "A/v2", "A/v3"]);
    assert_eq!(report.uploads_succeeded, 2);
    assert_eq!(report.uploads_failed, 1);
}
