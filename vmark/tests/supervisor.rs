#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use vmark::Error;
use vmark::error::TimeoutKind;
use vmark::process::display::SharedBuffer;
use vmark::process::progress;
use vmark::process::{ProcessSupervisor, ProgressDisplay, RunOptions};

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::default().with_terminate_grace(Duration::from_millis(500))
}

/// A pid is gone once it no longer exists or is only a zombie.
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[tokio::test]
async fn progress_lines_are_displayed_not_captured() {
    let buffer = SharedBuffer::new();
    let display = ProgressDisplay::with_writer(Box::new(buffer.clone()));
    let supervisor = ProcessSupervisor::new(display);

    let options = RunOptions::new()
        .capture()
        .display_id("job")
        .progress(progress::from_fn(|line| line.contains('%')));
    let output = supervisor
        .run("printf '5%%\\ndone\\n10%%\\n'", options)
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout.as_deref(), Some("done"));
    assert_eq!(output.last_progress.as_deref(), Some("10%"));

    let rendered = buffer.contents();
    let first = rendered.find("[job] 5%").expect("first update rendered");
    let second = rendered.find("[job] 10%").expect("second update rendered");
    assert!(first < second);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn silent_process_is_killed_after_idle_window() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let command = format!("echo $$ > '{}'; sleep 30", pid_file.display());

    let timeouts = Arc::new(AtomicUsize::new(0));
    let seen = timeouts.clone();
    let options = RunOptions::new()
        .idle_timeout(Some(Duration::from_millis(300)))
        .on_timeout(Arc::new(move |kind: TimeoutKind| {
            assert_eq!(kind, TimeoutKind::Idle);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    let started = std::time::Instant::now();
    let err = supervisor().run(&command, options).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Timeout {
            kind: TimeoutKind::Idle,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!is_running(pid));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn background_children_do_not_outlive_a_clean_exit() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let command = format!("sleep 30 & echo $! > '{}'; echo done", pid_file.display());

    let output = supervisor()
        .with_drain_grace(Duration::from_millis(200))
        .run(&command, RunOptions::new().capture())
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.as_deref(), Some("done"));

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!is_running(pid));
}

#[tokio::test]
async fn periodic_output_keeps_process_alive() {
    let options = RunOptions::new()
        .capture()
        .idle_timeout(Some(Duration::from_millis(800)));
    let output = supervisor()
        .run(
            "for i in 1 2 3 4 5; do echo tick $i; sleep 0.2; done",
            options,
        )
        .await
        .unwrap();

    assert!(output.success());
    assert_eq!(output.stdout.unwrap().lines().count(), 5);
}

#[tokio::test]
async fn output_on_stderr_alone_counts_as_activity() {
    let options = RunOptions::new().idle_timeout(Some(Duration::from_millis(800)));
    let output = supervisor()
        .run(
            "for i in 1 2 3 4; do echo tick >&2; sleep 0.2; done",
            options,
        )
        .await
        .unwrap();
    assert!(output.success());
}

#[tokio::test]
async fn total_timeout_ends_chatty_process() {
    let options = RunOptions::new()
        .total_timeout(Some(Duration::from_millis(400)))
        .idle_timeout(Some(Duration::from_secs(5)));
    let err = supervisor()
        .run("while true; do echo busy; sleep 0.05; done", options)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Timeout {
            kind: TimeoutKind::Total,
            ..
        }
    ));
}

#[tokio::test]
async fn spawn_failure_invokes_error_callback() {
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    let options = RunOptions::new()
        .cwd("/definitely/not/a/dir")
        .on_error(Arc::new(move |_: &Error| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    let err = supervisor().run("true", options).await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
