//! Per-recipient scheduling of items.
//!
//! For each recipient the orchestrator computes the pending items, prepares
//! the recipient, drains the invisible-mark items one at a time, then the
//! plain-mark items concurrently, and finally marks the recipient finished
//! once every discovered item is recorded. Failures stay local to the item or
//! recipient they happen in.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::discovery::{Item, ItemClass, Recipient};
use crate::state::StateStore;

/// Runs the stages of one item.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Create directories and recipient assets before any item runs.
    async fn prepare(&self, recipient: &Recipient) -> Result<()>;

    /// Process `item` for `recipient`. Failures are reported as `false`.
    async fn process(&self, recipient: &Recipient, item: &Item) -> bool;
}

/// Receives each successfully produced item, e.g. to upload it.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, item: &Item) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecipientOutcome {
    /// Already finished and nothing new was discovered.
    Skipped,
    /// Every discovered item is completed.
    Finished,
    /// Some items are still pending; the next run retries them.
    Incomplete,
    /// The recipient could not be processed at all.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientReport {
    pub name: String,
    pub outcome: RecipientOutcome,
    pub processed: Vec<String>,
    pub failed: Vec<String>,
}

impl RecipientReport {
    fn new(name: &str, outcome: RecipientOutcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            processed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub recipients: Vec<RecipientReport>,
    pub uploads_succeeded: usize,
    pub uploads_failed: usize,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.recipients.iter().map(|r| r.processed.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.recipients.iter().map(|r| r.failed.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.recipients
            .iter()
            .filter(|r| r.outcome == RecipientOutcome::Skipped)
            .count()
    }
}

type DeliveryResult = (String, String, Result<bool>);

/// Drives every recipient through the item pipeline.
pub struct PipelineOrchestrator {
    state: Arc<StateStore>,
    processor: Arc<dyn ItemProcessor>,
    sink: Option<Arc<dyn ResultSink>>,
    retry_missed: bool,
}

impl PipelineOrchestrator {
    pub fn new(state: Arc<StateStore>, processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            state,
            processor,
            sink: None,
            retry_missed: false,
        }
    }

    /// Give incomplete recipients one more pass after every recipient has run.
    pub fn with_retry_missed(mut self, retry: bool) -> Self {
        self.retry_missed = retry;
        self
    }

    /// Hand every successful item to `sink` in the background.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Process `recipients` sequentially over the discovered `items`.
    ///
    /// Never fails: recipient errors are logged and recorded in the report.
    /// Background deliveries are awaited before returning.
    pub async fn run(&self, recipients: &[Recipient], items: &[Item]) -> RunReport {
        let deliveries = parking_lot::Mutex::new(JoinSet::new());
        let mut report = RunReport::default();

        info!(
            recipients = recipients.len(),
            items = items.len(),
            "Starting run"
        );
        for recipient in recipients {
            let recipient_report = match self.run_recipient(recipient, items, &deliveries).await {
                Ok(recipient_report) => recipient_report,
                Err(e) => {
                    error!(recipient = %recipient.name, error = %e, "Recipient failed");
                    RecipientReport::new(&recipient.name, RecipientOutcome::Failed(e.to_string()))
                }
            };
            report.recipients.push(recipient_report);
        }

        if self.retry_missed {
            for (recipient, previous) in recipients.iter().zip(report.recipients.iter_mut()) {
                if previous.outcome != RecipientOutcome::Incomplete {
                    continue;
                }
                info!(
                    recipient = %recipient.name,
                    missed = previous.failed.len(),
                    "Retrying missed items"
                );
                match self.run_recipient(recipient, items, &deliveries).await {
                    Ok(retry) => {
                        previous.processed.extend(retry.processed);
                        previous.failed = retry.failed;
                        previous.outcome = retry.outcome;
                    }
                    Err(e) => {
                        error!(recipient = %recipient.name, error = %e, "Retry pass failed")
                    }
                }
            }
        }

        let mut deliveries = deliveries.into_inner();
        if !deliveries.is_empty() {
            info!(pending = deliveries.len(), "Waiting for background deliveries");
        }
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((recipient, item, Ok(true))) => {
                    debug!(recipient, item, "Delivered");
                    report.uploads_succeeded += 1;
                }
                Ok((recipient, item, Ok(false))) => {
                    warn!(recipient, item, "Delivery reported failure");
                    report.uploads_failed += 1;
                }
                Ok((recipient, item, Err(e))) => {
                    warn!(recipient, item, error = %e, "Delivery failed");
                    report.uploads_failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Delivery task panicked");
                    report.uploads_failed += 1;
                }
            }
        }

        info!(
            processed = report.processed(),
            failed = report.failed(),
            skipped = report.skipped(),
            uploads_succeeded = report.uploads_succeeded,
            uploads_failed = report.uploads_failed,
            "Run finished"
        );
        report
    }

    async fn run_recipient(
        &self,
        recipient: &Recipient,
        items: &[Item],
        deliveries: &parking_lot::Mutex<JoinSet<DeliveryResult>>,
    ) -> Result<RecipientReport> {
        let name = recipient.name.as_str();
        let discovered: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
        let pending_ids = self.state.pending(name, &discovered).await?;

        if pending_ids.is_empty() {
            if self.state.is_finished(name).await? {
                info!(recipient = name, "Already finished, skipping");
                return Ok(RecipientReport::new(name, RecipientOutcome::Skipped));
            }
            self.state.mark_finished(name).await?;
            return Ok(RecipientReport::new(name, RecipientOutcome::Finished));
        }

        info!(recipient = name, pending = pending_ids.len(), "Initializing recipient");
        self.processor.prepare(recipient).await?;

        let pending: HashSet<&str> = pending_ids.iter().map(String::as_str).collect();
        let (invisible, plain): (Vec<&Item>, Vec<&Item>) = items
            .iter()
            .filter(|item| pending.contains(item.id.as_str()))
            .partition(|item| item.class == ItemClass::InvisibleMark);

        let mut report = RecipientReport::new(name, RecipientOutcome::Incomplete);

        debug!(recipient = name, count = invisible.len(), "Processing invisible-mark items");
        for item in invisible {
            let ok = self.process_item(recipient, item, deliveries).await?;
            record(&mut report, item, ok);
        }

        debug!(recipient = name, count = plain.len(), "Processing plain-mark items");
        let results = join_all(
            plain
                .iter()
                .map(|item| self.process_item(recipient, item, deliveries)),
        )
        .await;
        let mut first_error = None;
        for (item, result) in plain.iter().zip(results) {
            match result {
                Ok(ok) => record(&mut report, item, ok),
                Err(e) => {
                    record(&mut report, item, false);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let completed = self.state.completed(name).await?;
        if discovered.iter().all(|id| completed.contains(id)) {
            self.state.mark_finished(name).await?;
            report.outcome = RecipientOutcome::Finished;
        } else {
            warn!(
                recipient = name,
                failed = report.failed.len(),
                "Recipient incomplete, remaining items retry on the next run"
            );
        }
        Ok(report)
    }

    /// Process one item; on success record it and queue its delivery.
    ///
    /// Only a failure to record completion is an error.
    async fn process_item(
        &self,
        recipient: &Recipient,
        item: &Item,
        deliveries: &parking_lot::Mutex<JoinSet<DeliveryResult>>,
    ) -> Result<bool> {
        info!(recipient = %recipient.name, item = %item.id, class = %item.class, "Processing item");
        if !self.processor.process(recipient, item).await {
            warn!(recipient = %recipient.name, item = %item.id, "Item failed");
            return Ok(false);
        }
        self.state
            .add_completed(&recipient.name, [item.id.clone()])
            .await?;
        info!(recipient = %recipient.name, item = %item.id, "Item completed");

        if let Some(sink) = &self.sink {
            let sink = sink.clone();
            let recipient = recipient.clone();
            let item = item.clone();
            deliveries.lock().spawn(async move {
                let result = sink.deliver(&recipient, &item).await;
                (recipient.name, item.id, result)
            });
        }
        Ok(true)
    }
}

fn record(report: &mut RecipientReport, item: &Item, ok: bool) {
    if ok {
        report.processed.push(item.id.clone());
    } else {
        report.failed.push(item.id.clone());
    }
}
