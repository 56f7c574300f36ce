//! A single pipeline stage run behind its concurrency pool.

use std::future::Future;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::pipeline::gate::{ConcurrencyGate, PoolKind};
use crate::process::progress::summarize_ffmpeg;
use crate::process::{ProcessSupervisor, RunOptions, RunOutput};
use crate::{Error, Result};

/// What a stage needs beyond exit code 0 to count as successful.
#[derive(Debug, Clone, Default)]
pub struct SuccessPolicy {
    /// Text that must appear in captured stdout.
    pub output_marker: Option<String>,
    /// File that must exist afterwards.
    pub output_file: Option<PathBuf>,
}

impl SuccessPolicy {
    /// Check `output` against the policy, naming the first unmet requirement.
    pub fn check(&self, output: &RunOutput) -> std::result::Result<(), String> {
        if !output.success() {
            let detail = output
                .stderr
                .as_deref()
                .and_then(|s| s.lines().last())
                .map(|line| format!(": {line}"))
                .unwrap_or_default();
            return Err(format!("exit code {:?}{detail}", output.exit_code));
        }
        if let Some(marker) = &self.output_marker
            && !output.stdout_contains(marker)
        {
            return Err(format!("output marker {marker:?} missing"));
        }
        if let Some(file) = &self.output_file
            && !file.is_file()
        {
            return Err(format!("expected output {} missing", file.display()));
        }
        Ok(())
    }
}

/// One external command with its pool, run options and success policy.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub pool: PoolKind,
    pub command: String,
    pub options: RunOptions,
    pub policy: SuccessPolicy,
}

impl Stage {
    pub fn new(name: impl Into<String>, pool: PoolKind, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool,
            command: command.into(),
            options: RunOptions::default(),
            policy: SuccessPolicy::default(),
        }
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn expect_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy.output_file = Some(path.into());
        self
    }

    /// Require `marker` in stdout; turns on output capture.
    pub fn expect_marker(mut self, marker: impl Into<String>) -> Self {
        self.policy.output_marker = Some(marker.into());
        self.options.capture_output = true;
        self
    }
}

/// Runs stages through the gate and the supervisor.
#[derive(Debug, Clone)]
pub struct StageRunner {
    supervisor: ProcessSupervisor,
    gate: ConcurrencyGate,
}

impl StageRunner {
    pub fn new(supervisor: ProcessSupervisor, gate: ConcurrencyGate) -> Self {
        Self { supervisor, gate }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Run `stage` and apply its success policy.
    ///
    /// Timeouts and spawn failures keep their error kind; an unmet policy
    /// becomes [`Error::ProcessFailure`].
    pub async fn execute(&self, stage: Stage) -> Result<RunOutput> {
        let Stage {
            name,
            pool,
            command,
            options,
            policy,
        } = stage;

        let output = self
            .gate
            .with_permit(pool, self.supervisor.run(&command, options))
            .await?;
        policy
            .check(&output)
            .map_err(|reason| Error::process_failure(&name, reason))?;

        match output.last_progress.as_deref() {
            Some(progress) => info!(
                stage = %name,
                elapsed = ?output.elapsed,
                progress = %summarize_ffmpeg(progress),
                "Stage finished"
            ),
            None => info!(stage = %name, elapsed = ?output.elapsed, "Stage finished"),
        }
        Ok(output)
    }

    /// Run `stage`, reporting only whether it succeeded.
    pub async fn run(&self, stage: Stage) -> bool {
        let name = stage.name.clone();
        match self.execute(stage).await {
            Ok(_) => true,
            Err(e) => {
                warn!(stage = %name, error = %e, "Stage failed");
                false
            }
        }
    }

    /// Run non-process stage work while holding a permit from `pool`.
    pub async fn run_task<F, T>(&self, name: &str, pool: PoolKind, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = self.gate.with_permit(pool, task).await;
        if let Err(e) = &result {
            warn!(stage = name, error = %e, "Stage failed");
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> StageRunner {
        StageRunner::new(ProcessSupervisor::default(), ConcurrencyGate::new(2))
    }

    #[tokio::test]
    async fn test_exit_code_zero_is_success() {
        assert!(runner().run(Stage::new("noop", PoolKind::Bounded, "true")).await);
        assert!(!runner().run(Stage::new("fail", PoolKind::Bounded, "false")).await);
    }

    #[tokio::test]
    async fn test_marker_required() {
        let ok = Stage::new("upload", PoolKind::Bounded, "echo 'upload ok'").expect_marker("ok");
        assert!(runner().run(ok).await);

        let missing = Stage::new("upload", PoolKind::Bounded, "echo nope").expect_marker("ok");
        let err = runner().execute(missing).await.unwrap_err();
        assert!(matches!(err, Error::ProcessFailure { .. }));
    }

    #[tokio::test]
    async fn test_output_file_required() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result.mp4");
        let command = format!("touch {}", process_utils::quote_arg(out.to_str().unwrap()));

        let missing = Stage::new("compose", PoolKind::Exclusive, "true").expect_file(&out);
        assert!(!runner().run(missing).await);

        let produced = Stage::new("compose", PoolKind::Exclusive, command).expect_file(&out);
        assert!(runner().run(produced).await);
    }

    #[tokio::test]
    async fn test_timeout_becomes_false() {
        let stage = Stage::new("slow", PoolKind::Bounded, "sleep 5").options(
            RunOptions::new().total_timeout(Some(std::time::Duration::from_millis(100))),
        );
        let runner = StageRunner::new(
            ProcessSupervisor::default().with_terminate_grace(std::time::Duration::from_millis(200)),
            ConcurrencyGate::new(1),
        );
        assert!(!runner.run(stage).await);
        assert_eq!(runner.gate().available(PoolKind::Bounded), 1);
    }
}
