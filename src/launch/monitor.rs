//! Launch monitor
//!
//! Spawns one server process, watches its merged output on a dedicated
//! reader task and classifies the attempt. The reader reports exactly one
//! terminal [`ReaderSignal`] over a oneshot channel; the control loop selects
//! on that channel, on process exit and on the deadline.

use crate::errors::{Result, TuneError};
use crate::history::OutcomeTag;
use crate::launch::command::LaunchCommand;
use crate::launch::process::{self, TERMINATION_GRACE};
use crate::launch::signals::{LineSignal, SignalMatcher};
use crate::vram::{VramOracle, VramSnapshot};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

/// Shortest wait between the success line and the VRAM reading
pub const MIN_STABILISATION: Duration = Duration::from_secs(2);

/// Longest line handled as one; longer output is split into several
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// How long output is still drained after the process has exited
const EXIT_DRAIN: Duration = Duration::from_secs(2);

/// Monitor timing and margins
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Wall-clock bound from spawn to a definitive signal
    pub loading_timeout: Duration,
    /// Wait after success before measuring VRAM
    pub stabilisation: Duration,
    /// Free VRAM below this after load is classified as tight
    pub min_free_after_load_mb: u64,
    pub tail_lines: usize,
    pub termination_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            loading_timeout: Duration::from_secs(60),
            stabilisation: Duration::from_secs(3),
            min_free_after_load_mb: 512,
            tail_lines: 40,
            termination_grace: TERMINATION_GRACE,
        }
    }
}

/// Terminal message of the reader task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderSignal {
    Success { line: String },
    Failure { keyword: String, line: String },
    StreamEnded,
    DecodeError(String),
}

/// Result of one monitored attempt
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub outcome: OutcomeTag,
    pub pid: Option<u32>,
    /// Budgeted free VRAM before launch, when there was a reading
    pub vram_before_mb: Option<u64>,
    pub vram_after: Option<VramSnapshot>,
    pub approx_vram_used_mb: Option<u64>,
    /// Keyword and line that triggered a failure classification
    pub failure: Option<(String, String)>,
    pub exit_status: Option<String>,
    /// Last non-empty output lines
    pub tail: Vec<String>,
    pub elapsed: Duration,
}

impl LaunchReport {
    fn new(outcome: OutcomeTag, pid: Option<u32>, vram_before_mb: Option<u64>) -> Self {
        Self {
            outcome,
            pid,
            vram_before_mb,
            vram_after: None,
            approx_vram_used_mb: None,
            failure: None,
            exit_status: None,
            tail: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

/// Owner of at most one live monitored server
pub struct LaunchMonitor {
    settings: MonitorSettings,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
}

impl LaunchMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            child: None,
            reader: None,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Whether a monitored process is still alive
    pub fn is_busy(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(_) => {
                self.child = None;
                false
            }
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Hand the live server to the caller; output keeps being drained
    pub fn release(&mut self) -> Option<Child> {
        self.reader.take();
        self.child.take()
    }

    /// Stop the live server, if any
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!(pid = ?child.id(), "stopping monitored server");
            process::terminate(&mut child, self.settings.termination_grace).await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Launch `command` and classify the attempt
    ///
    /// External failures come back as outcome tags. Only a busy monitor and
    /// VRAM oracle faults are errors.
    pub async fn launch_and_watch(
        &mut self,
        command: &LaunchCommand,
        matcher: &SignalMatcher,
        oracle: &dyn VramOracle,
        before: &VramSnapshot,
    ) -> Result<LaunchReport> {
        if self.is_busy() {
            return Err(TuneError::MonitorBusy { pid: self.pid() });
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let vram_before_mb = before.has_reading().then(|| before.budgeted_free_mb());
        let started = Instant::now();
        let mut deadline = started + self.settings.loading_timeout;

        let mut child = match process::spawn_monitored(command) {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "server could not be started");
                let mut report = LaunchReport::new(OutcomeTag::LaunchFailedSetup, None, vram_before_mb);
                report.tail.push(e.to_string());
                return Ok(report);
            }
        };
        let pid = child.id();
        info!(?pid, command = %command, "server spawned");

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.settings.tail_lines)));
        let (tx, mut rx) = oneshot::channel();
        let reader = tokio::spawn(read_output(
            child.stdout.take(),
            child.stderr.take(),
            matcher.clone(),
            tail.clone(),
            self.settings.tail_lines,
            tx,
        ));

        let mut reader_done = false;
        let mut exit_status = None;

        let outcome = loop {
            tokio::select! {
                signal = &mut rx, if !reader_done => {
                    match signal {
                        Ok(ReaderSignal::Success { line }) => {
                            debug!(line = %line, "success line observed");
                            break Classified::Success;
                        }
                        Ok(ReaderSignal::Failure { keyword, line }) => {
                            break Classified::Failure { keyword, line };
                        }
                        Ok(ReaderSignal::DecodeError(e)) => {
                            warn!(error = %e, "server output could not be read");
                            reader_done = true;
                        }
                        Ok(ReaderSignal::StreamEnded) | Err(_) => reader_done = true,
                    }
                    if reader_done && exit_status.is_some() {
                        break Classified::PrematureExit;
                    }
                }
                status = child.wait(), if exit_status.is_none() => {
                    let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                    debug!(status = %status, "server exited");
                    exit_status = Some(status);
                    if reader_done {
                        break Classified::PrematureExit;
                    }
                    deadline = deadline.min(Instant::now() + EXIT_DRAIN);
                }
                _ = sleep_until(deadline) => {
                    break if exit_status.is_some() {
                        Classified::PrematureExit
                    } else {
                        Classified::Timeout
                    };
                }
            }
        };

        let mut report = LaunchReport::new(OutcomeTag::PrematureExit, pid, vram_before_mb);
        report.exit_status = exit_status;

        match outcome {
            Classified::Success => {
                self.child = Some(child);
                self.reader = Some(reader);
                if let Err(e) = self.measure(&mut report, oracle, before).await {
                    self.stop().await;
                    return Err(e);
                }
            }
            other => {
                report.outcome = match other {
                    Classified::Failure { keyword, line } => {
                        report.failure = Some((keyword, line));
                        OutcomeTag::OomCrash
                    }
                    Classified::Timeout => OutcomeTag::TimeoutNoSignal,
                    _ => OutcomeTag::PrematureExit,
                };
                process::terminate(&mut child, self.settings.termination_grace).await;
                reader.abort();
            }
        }

        report.tail = tail.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default();
        report.elapsed = started.elapsed();
        info!(
            outcome = %report.outcome,
            used_mb = ?report.approx_vram_used_mb,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "attempt classified"
        );
        Ok(report)
    }

    /// Measure VRAM after the stabilisation wait and refine the outcome
    async fn measure(&self, report: &mut LaunchReport, oracle: &dyn VramOracle, before: &VramSnapshot) -> Result<()> {
        sleep(self.settings.stabilisation.max(MIN_STABILISATION)).await;
        let after = oracle.query()?;

        let total = before.budgeted_total_mb().max(after.budgeted_total_mb());
        if !before.has_reading() || !after.has_reading() || total == 0 {
            report.outcome = OutcomeTag::SuccessLoadNoVramCheck;
        } else {
            let free_after = after.budgeted_free_mb();
            let used = before.budgeted_free_mb().saturating_sub(free_after).min(total);
            report.approx_vram_used_mb = Some(used);
            report.outcome = if free_after < self.settings.min_free_after_load_mb {
                OutcomeTag::SuccessLoadVramTight
            } else {
                OutcomeTag::SuccessLoadVramOk
            };
        }
        report.vram_after = Some(after);
        Ok(())
    }
}

enum Classified {
    Success,
    Failure { keyword: String, line: String },
    PrematureExit,
    Timeout,
}

/// Reads both output streams line by line until both end
///
/// After the terminal signal is sent the reader keeps draining so an
/// accepted server never blocks on a full pipe.
async fn read_output<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    matcher: SignalMatcher,
    tail: Tail,
    tail_lines: usize,
    tx: oneshot::Sender<ReaderSignal>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(BufReader::new);
    let mut err = stderr.map(BufReader::new);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut tx = Some(tx);
    let mut read_error = None;

    while out.is_some() || err.is_some() {
        let (from_stdout, result) = tokio::select! {
            r = read_chunk(&mut out, &mut out_buf), if out.is_some() => (true, r),
            r = read_chunk(&mut err, &mut err_buf), if err.is_some() => (false, r),
        };

        match result {
            Ok(0) => close(from_stdout, &mut out, &mut err),
            Ok(_) => {
                let buf = if from_stdout { &mut out_buf } else { &mut err_buf };
                let line = String::from_utf8_lossy(buf).trim_end().to_string();
                buf.clear();
                handle_line(&line, &matcher, &tail, tail_lines, &mut tx);
            }
            Err(e) => {
                debug!(error = %e, "output stream failed");
                read_error = Some(e.to_string());
                close(from_stdout, &mut out, &mut err);
            }
        }
    }

    if let Some(tx) = tx {
        let signal = match read_error {
            Some(e) => ReaderSignal::DecodeError(e),
            None => ReaderSignal::StreamEnded,
        };
        let _ = tx.send(signal);
    }
}

fn close<O, E>(stdout: bool, out: &mut Option<O>, err: &mut Option<E>) {
    if stdout {
        *out = None;
    } else {
        *err = None;
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<BufReader<R>>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    match reader.as_mut() {
        Some(r) => {
            let room = MAX_LINE_BYTES.saturating_sub(buf.len());
            if room == 0 {
                return Ok(buf.len());
            }
            r.take(room as u64).read_until(b'\n', buf).await
        }
        None => std::future::pending().await,
    }
}

fn handle_line(
    line: &str,
    matcher: &SignalMatcher,
    tail: &Tail,
    tail_lines: usize,
    tx: &mut Option<oneshot::Sender<ReaderSignal>>,
) {
    trace!(target: "server", "{}", line);
    if line.trim().is_empty() {
        return;
    }

    if let Ok(mut tail) = tail.lock() {
        while tail.len() >= tail_lines.max(1) {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    if tx.is_none() {
        return;
    }
    let signal = match matcher.classify(line) {
        LineSignal::Success => ReaderSignal::Success { line: line.to_string() },
        LineSignal::Failure { keyword } => ReaderSignal::Failure {
            keyword,
            line: line.to_string(),
        },
        LineSignal::ForeignPort(port) => {
            debug!(port, expected = matcher.target_port(), "success line for another port ignored");
            return;
        }
        LineSignal::Nothing => return,
    };
    if let Some(tx) = tx.take() {
        let _ = tx.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vram::{GpuVendor, StaticOracle};

    fn settings(timeout_ms: u64) -> MonitorSettings {
        MonitorSettings {
            loading_timeout: Duration::from_millis(timeout_ms),
            stabilisation: Duration::ZERO,
            min_free_after_load_mb: 512,
            tail_lines: 3,
            termination_grace: Duration::from_millis(300),
        }
    }

    fn script(body: &str) -> LaunchCommand {
        LaunchCommand::raw("sh", vec!["-c".to_string(), body.to_string()])
    }

    fn matcher() -> SignalMatcher {
        SignalMatcher::with_defaults(5001).unwrap()
    }

    fn before() -> VramSnapshot {
        VramSnapshot::new(10_000, 12_000, GpuVendor::Nvidia)
    }

    #[tokio::test]
    async fn test_reader_ignores_foreign_port_and_latches_success() {
        let input: &[u8] = b"Starting Kobold API on port 5000\nloading\nStarting Kobold API on port 5001\nCUDA out of memory\n";
        let (tx, rx) = oneshot::channel();
        let tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
        read_output(Some(input), None::<&[u8]>, matcher(), tail.clone(), 2, tx).await;

        assert_eq!(
            rx.await.unwrap(),
            ReaderSignal::Success {
                line: "Starting Kobold API on port 5001".to_string()
            }
        );
        let tail: Vec<String> = tail.lock().unwrap().iter().cloned().collect();
        assert_eq!(tail, vec!["Starting Kobold API on port 5001", "CUDA out of memory"]);
    }

    #[tokio::test]
    async fn test_reader_reports_stream_end() {
        let (tx, rx) = oneshot::channel();
        let tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
        read_output(Some(&b"hello\nworld"[..]), Some(&b"warn\n"[..]), matcher(), tail.clone(), 10, tx).await;
        assert_eq!(rx.await.unwrap(), ReaderSignal::StreamEnded);
        assert_eq!(tail.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_outcome() {
        let mut monitor = LaunchMonitor::new(settings(1000));
        let cmd = LaunchCommand::raw("/no/such/server", vec![]);
        let report = monitor
            .launch_and_watch(&cmd, &matcher(), &StaticOracle::new(before()), &before())
            .await
            .unwrap();
        assert_eq!(report.outcome, OutcomeTag::LaunchFailedSetup);
        assert!(!monitor.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_measures_vram_and_keeps_server() {
        let mut monitor = LaunchMonitor::new(settings(5000));
        let oracle = StaticOracle::new(VramSnapshot::new(4_000, 12_000, GpuVendor::Nvidia));
        let cmd = script("echo 'Starting Kobold API on port 5001'; sleep 30");

        let report = monitor.launch_and_watch(&cmd, &matcher(), &oracle, &before()).await.unwrap();
        assert_eq!(report.outcome, OutcomeTag::SuccessLoadVramOk);
        assert_eq!(report.approx_vram_used_mb, Some(6_000));
        assert!(monitor.is_busy());

        let err = monitor
            .launch_and_watch(&cmd, &matcher(), &oracle, &before())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::MonitorBusy { .. }));

        monitor.stop().await;
        assert!(!monitor.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tight_vram_after_load() {
        let mut monitor = LaunchMonitor::new(settings(5000));
        let oracle = StaticOracle::new(VramSnapshot::new(300, 12_000, GpuVendor::Nvidia));
        let cmd = script("echo 'Starting Kobold API on port 5001'; sleep 30");

        let report = monitor.launch_and_watch(&cmd, &matcher(), &oracle, &before()).await.unwrap();
        assert_eq!(report.outcome, OutcomeTag::SuccessLoadVramTight);
        monitor.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oracle_fault_stops_server() {
        let mut monitor = LaunchMonitor::new(settings(5000));
        let oracle = StaticOracle::scripted(vec![Err("driver gone".to_string())]);
        let cmd = script("echo 'Starting Kobold API on port 5001'; sleep 30");

        let err = monitor
            .launch_and_watch(&cmd, &matcher(), &oracle, &before())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Oracle(_)));
        assert!(!monitor.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oom_line_kills_process() {
        let mut monitor = LaunchMonitor::new(settings(5000));
        let cmd = script("echo 'ggml: CUDA out of memory'; sleep 30");
        let report = monitor
            .launch_and_watch(&cmd, &matcher(), &StaticOracle::new(before()), &before())
            .await
            .unwrap();
        assert_eq!(report.outcome, OutcomeTag::OomCrash);
        assert_eq!(report.failure.as_ref().map(|f| f.0.as_str()), Some("cuda out of memory"));
        assert!(!monitor.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_premature_exit_and_timeout() {
        let mut monitor = LaunchMonitor::new(settings(800));
        let oracle = StaticOracle::new(before());

        let report = monitor
            .launch_and_watch(&script("echo loading; exit 3"), &matcher(), &oracle, &before())
            .await
            .unwrap();
        assert_eq!(report.outcome, OutcomeTag::PrematureExit);
        assert_eq!(report.tail, vec!["loading"]);

        let report = monitor
            .launch_and_watch(&script("echo loading; sleep 30"), &matcher(), &oracle, &before())
            .await
            .unwrap();
        assert_eq!(report.outcome, OutcomeTag::TimeoutNoSignal);
        assert!(!monitor.is_busy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_no_vram_reading() {
        let mut monitor = LaunchMonitor::new(settings(5000));
        let none = VramSnapshot::unavailable("no gpu");
        let oracle = StaticOracle::new(none.clone());
        let cmd = script("echo 'Starting Kobold API on port 5001'; sleep 30");

        let report = monitor.launch_and_watch(&cmd, &matcher(), &oracle, &none).await.unwrap();
        assert_eq!(report.outcome, OutcomeTag::SuccessLoadNoVramCheck);
        assert_eq!(report.approx_vram_used_mb, None);
        monitor.stop().await;
    }
}
