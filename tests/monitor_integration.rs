//! Launch monitor against `sh -c` servers

#![cfg(unix)]

use offloadtune::history::OutcomeTag;
use offloadtune::launch::monitor::MAX_LINE_BYTES;
use offloadtune::launch::{LaunchCommand, LaunchMonitor, MonitorSettings, SignalMatcher};
use offloadtune::vram::{StaticOracle, VramOracle};
use offloadtune::TuneError;
use std::time::Duration;

fn sh(script: &str) -> LaunchCommand {
    LaunchCommand::raw("sh", vec!["-c".to_string(), script.to_string()])
}

fn monitor(timeout: Duration) -> LaunchMonitor {
    LaunchMonitor::new(MonitorSettings {
        loading_timeout: timeout,
        stabilisation: Duration::ZERO,
        termination_grace: Duration::from_millis(300),
        ..MonitorSettings::default()
    })
}

#[tokio::test]
async fn test_success_is_not_overridden_by_later_failure_text() {
    let oracle = StaticOracle::fixed(10_000, 12_000);
    let before = oracle.query().unwrap();
    let matcher = SignalMatcher::with_defaults(5001).unwrap();
    let mut m = monitor(Duration::from_secs(5));

    let script = "echo 'Starting Kobold API on port 5001'; echo 'CUDA out of memory'; sleep 30";
    let report = m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap();

    assert_eq!(report.outcome, OutcomeTag::SuccessLoadVramOk);
    assert!(report.failure.is_none());
    assert!(m.is_busy());
    m.stop().await;
    assert!(!m.is_busy());
}

#[tokio::test]
async fn test_foreign_port_times_out_and_kills() {
    let oracle = StaticOracle::fixed(10_000, 12_000);
    let before = oracle.query().unwrap();
    let matcher = SignalMatcher::with_defaults(5001).unwrap();
    let mut m = monitor(Duration::from_millis(800));

    let script = "echo 'Starting Kobold API on port 5000'; sleep 30";
    let report = m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap();

    assert_eq!(report.outcome, OutcomeTag::TimeoutNoSignal);
    assert!(report.tail.iter().any(|l| l.contains("port 5000")));
    assert!(!m.is_busy());
}

#[tokio::test]
async fn test_stderr_failure_is_seen() {
    let oracle = StaticOracle::fixed(10_000, 12_000);
    let before = oracle.query().unwrap();
    let matcher = SignalMatcher::with_defaults(5001).unwrap();
    let mut m = monitor(Duration::from_secs(5));

    let script = "echo 'loading' ; echo 'ggml_cuda_host_malloc: failed to allocate 4096 MB' 1>&2; sleep 30";
    let report = m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap();

    assert_eq!(report.outcome, OutcomeTag::OomCrash);
    let (keyword, _) = report.failure.unwrap();
    assert_eq!(keyword, "ggml_cuda_host_malloc: failed to allocate");
}

#[tokio::test]
async fn test_second_launch_while_busy_is_rejected() {
    let oracle = StaticOracle::fixed(10_000, 12_000);
    let before = oracle.query().unwrap();
    let matcher = SignalMatcher::with_defaults(5001).unwrap();
    let mut m = monitor(Duration::from_secs(5));

    let script = "echo 'Starting Kobold API on port 5001'; sleep 30";
    m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap();

    let err = m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap_err();
    assert!(matches!(err, TuneError::MonitorBusy { .. }));

    let mut child = m.release().unwrap();
    assert!(!m.is_busy());
    offloadtune::launch::process::terminate(&mut child, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_output_without_newlines_is_split() {
    let oracle = StaticOracle::fixed(10_000, 12_000);
    let before = oracle.query().unwrap();
    let matcher = SignalMatcher::with_defaults(5001).unwrap();
    let mut m = monitor(Duration::from_secs(5));

    let script = "head -c 200000 /dev/zero | tr '\\0' x; echo; echo 'Starting Kobold API on port 5001'; sleep 30";
    let report = m.launch_and_watch(&sh(script), &matcher, &oracle, &before).await.unwrap();
    m.stop().await;

    assert_eq!(report.outcome, OutcomeTag::SuccessLoadVramOk);
    let chunks: Vec<&String> = report.tail.iter().filter(|l| l.starts_with('x')).collect();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|l| l.len() <= MAX_LINE_BYTES));
    assert_eq!(chunks.iter().map(|l| l.len()).sum::<usize>(), 200_000);
}
