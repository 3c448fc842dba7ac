/// The sample-and-react loop.
///
/// Each cycle reads the target's resident memory, sends SIGTERM once if it is
/// above the threshold, optionally measures CPU over a one-second window, and
/// sleeps out the rest of the refresh interval. The loop ends after
/// `max_iterations` cycles, after reacting, or when consecutive read failures
/// pass the retry ceiling.
use crate::config::MonitorConfig;
use crate::procfs::{ProcessSampler, ReadError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::signals::ProcessTerminator;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Length of the CPU measurement window inside each cycle.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Monitor phases. `Completed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sampling,
    Reacting,
    Completed,
    Aborted,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Ran `max_iterations` cycles without crossing the threshold.
    MaxIterations,
    /// Memory went over the threshold; `delivered` is false if SIGTERM failed.
    ThresholdExceeded { rss_kb: u64, delivered: bool },
    /// Consecutive read failures passed the retry ceiling.
    ReadFailures { failures: u32 },
}

/// Final result of a monitoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    pub phase: Phase,
    pub reason: StopReason,
    pub iterations: u32,
    pub elapsed: Duration,
}

impl MonitorOutcome {
    /// Process exit code: 0 for `Completed`, 2 for `Aborted`.
    pub fn exit_code(&self) -> u8 {
        match self.phase {
            Phase::Aborted => 2,
            _ => 0,
        }
    }
}

/// Loop-owned mutable state.
pub struct MonitorState {
    pub phase: Phase,
    pub iteration_count: u32,
    pub last_cpu_ticks: Option<u64>,
    pub signals_sent: u32,
    retry: RetryPolicy,
}

impl MonitorState {
    fn new(max_read_retries: u32) -> Self {
        Self {
            phase: Phase::Sampling,
            iteration_count: 0,
            last_cpu_ticks: None,
            signals_sent: 0,
            retry: RetryPolicy::new(max_read_retries),
        }
    }

    /// Consecutive memory read failures since the last success.
    pub fn consecutive_read_failures(&self) -> u32 {
        self.retry.consecutive_failures()
    }
}

/// What one memory reading means for the rest of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CycleDecision {
    /// Sample logged, under threshold.
    Continue,
    /// No sample this cycle; retry next time.
    Skip,
    /// Over threshold.
    React { rss_kb: u64 },
    /// Retry ceiling exceeded.
    Abort,
}

/// CPU time used between two tick samples, in CPU-seconds per second of
/// wall time when the samples are one second apart.
pub fn cpu_usage(ticks_before: u64, ticks_after: u64, clock_ticks_per_second: u64) -> f64 {
    if clock_ticks_per_second == 0 {
        return 0.0;
    }
    ticks_after.saturating_sub(ticks_before) as f64 / clock_ticks_per_second as f64
}

pub struct MonitorLoop<S, T> {
    config: MonitorConfig,
    sampler: S,
    terminator: T,
    clock_ticks_per_second: u64,
    state: MonitorState,
}

impl<S: ProcessSampler, T: ProcessTerminator> MonitorLoop<S, T> {
    pub fn new(
        config: MonitorConfig,
        sampler: S,
        terminator: T,
        clock_ticks_per_second: u64,
    ) -> Self {
        let state = MonitorState::new(config.max_read_retries);
        Self {
            config,
            sampler,
            terminator,
            clock_ticks_per_second,
            state,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Drive cycles until a terminal phase is reached.
    pub async fn run(&mut self) -> MonitorOutcome {
        let pid = self.config.target_pid;

        loop {
            if self.state.iteration_count >= self.config.max_iterations {
                info!(
                    pid,
                    iterations = self.state.iteration_count,
                    "reached max iterations"
                );
                return self.finish(StopReason::MaxIterations);
            }

            self.state.iteration_count += 1;
            let reading = self.sampler.resident_memory_kb(pid);

            match self.evaluate_memory(reading) {
                CycleDecision::Abort => {
                    let failures = self.state.consecutive_read_failures();
                    return self.finish(StopReason::ReadFailures { failures });
                }
                CycleDecision::React { rss_kb } => {
                    let delivered = self.react(rss_kb);
                    return self.finish(StopReason::ThresholdExceeded { rss_kb, delivered });
                }
                CycleDecision::Skip => sleep(self.config.refresh_interval).await,
                CycleDecision::Continue if self.config.sample_cpu => self.sample_cpu().await,
                CycleDecision::Continue => sleep(self.config.refresh_interval).await,
            }
        }
    }

    /// Apply the retry policy and the threshold to one memory reading.
    fn evaluate_memory(&mut self, reading: Result<u64, ReadError>) -> CycleDecision {
        let pid = self.config.target_pid;
        let iteration = self.state.iteration_count;

        let rss_kb = match reading {
            Ok(kb) => kb,
            Err(e) => {
                return match self.state.retry.record_failure(e) {
                    RetryDecision::Retry { .. } => CycleDecision::Skip,
                    RetryDecision::Abort => CycleDecision::Abort,
                };
            }
        };

        self.state.retry.record_success();
        info!(pid, iteration, rss_kb, "memory sample");

        if rss_kb > self.config.memory_threshold_kb {
            CycleDecision::React { rss_kb }
        } else {
            CycleDecision::Continue
        }
    }

    /// Send SIGTERM once. Returns whether the signal was delivered.
    fn react(&mut self, rss_kb: u64) -> bool {
        let pid = self.config.target_pid;
        self.state.phase = Phase::Reacting;
        warn!(
            pid,
            rss_kb,
            threshold_kb = self.config.memory_threshold_kb,
            "memory threshold exceeded, sending SIGTERM"
        );

        // TODO: escalate to SIGKILL when system-wide memory pressure is critical,
        // not just this process's RSS.
        self.state.signals_sent += 1;
        match self.terminator.terminate(pid) {
            Ok(()) => {
                info!(pid, "SIGTERM delivered");
                true
            }
            Err(e) => {
                error!(pid, error = %e, "failed to terminate process");
                false
            }
        }
    }

    /// Measure CPU over a one-second window, then sleep out the interval.
    async fn sample_cpu(&mut self) {
        let pid = self.config.target_pid;
        let before = self.sampler.cpu_ticks(pid);
        sleep(CPU_SAMPLE_WINDOW).await;
        let after = self.sampler.cpu_ticks(pid);

        match (before, after) {
            (Ok(before), Ok(after)) => {
                let usage = cpu_usage(before, after, self.clock_ticks_per_second);
                if let Some(last) = self.state.last_cpu_ticks {
                    debug!(pid, ticks_since_last = after.saturating_sub(last), "cpu ticks");
                }
                info!(
                    pid,
                    cpu_seconds = usage,
                    cpu_percent = usage * 100.0,
                    "cpu sample"
                );
                self.state.last_cpu_ticks = Some(after);
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(pid, error = %e, "cpu sample unavailable");
            }
        }

        sleep(self.config.refresh_interval.saturating_sub(CPU_SAMPLE_WINDOW)).await;
    }

    fn finish(&mut self, reason: StopReason) -> MonitorOutcome {
        let iterations = self.state.iteration_count;
        let elapsed = self
            .config
            .refresh_interval
            .checked_mul(iterations)
            .unwrap_or(Duration::MAX);
        let pid = self.config.target_pid;

        self.state.phase = match reason {
            StopReason::ReadFailures { .. } => Phase::Aborted,
            _ => Phase::Completed,
        };

        debug!(
            pid,
            signals_sent = self.state.signals_sent,
            phase = ?self.state.phase,
            "monitor stopped"
        );

        MonitorOutcome {
            phase: self.state.phase,
            reason,
            iterations,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalError;
    use crate::test_support::CapturedLogs;
    use nix::errno::Errno;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::PathBuf;

    fn unavailable() -> ReadError {
        ReadError::Unavailable {
            path: PathBuf::from("/proc/4242/status"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
    }

    /// Replays scripted readings; once a script runs dry it keeps returning
    /// its fallback value.
    struct FakeSampler {
        memory: RefCell<VecDeque<Result<u64, ReadError>>>,
        memory_fallback: u64,
        ticks: RefCell<VecDeque<Result<u64, ReadError>>>,
        memory_reads: Cell<u32>,
        tick_reads: Cell<u32>,
    }

    impl FakeSampler {
        fn new(memory: Vec<Result<u64, ReadError>>) -> Self {
            Self {
                memory: RefCell::new(memory.into()),
                memory_fallback: 100,
                ticks: RefCell::new(VecDeque::new()),
                memory_reads: Cell::new(0),
                tick_reads: Cell::new(0),
            }
        }

        fn with_ticks(mut self, ticks: Vec<Result<u64, ReadError>>) -> Self {
            self.ticks = RefCell::new(ticks.into());
            self
        }
    }

    impl ProcessSampler for FakeSampler {
        fn resident_memory_kb(&self, _pid: u32) -> Result<u64, ReadError> {
            self.memory_reads.set(self.memory_reads.get() + 1);
            self.memory
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(self.memory_fallback))
        }

        fn cpu_ticks(&self, _pid: u32) -> Result<u64, ReadError> {
            self.tick_reads.set(self.tick_reads.get() + 1);
            self.ticks.borrow_mut().pop_front().unwrap_or(Ok(0))
        }
    }

    #[derive(Default)]
    struct FakeTerminator {
        calls: Vec<u32>,
        fail: bool,
    }

    impl ProcessTerminator for FakeTerminator {
        fn terminate(&mut self, pid: u32) -> Result<(), SignalError> {
            self.calls.push(pid);
            if self.fail {
                return Err(SignalError::Delivery {
                    pid,
                    source: Errno::ESRCH,
                });
            }
            Ok(())
        }
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            target_pid: 4242,
            refresh_interval: Duration::from_secs(2),
            memory_threshold_kb: 10240,
            cpu_threshold_percent: 50.0,
            max_iterations: 4,
            max_read_retries: 8,
            sample_cpu: false,
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn monitor(
        config: MonitorConfig,
        sampler: FakeSampler,
    ) -> MonitorLoop<FakeSampler, FakeTerminator> {
        MonitorLoop::new(config, sampler, FakeTerminator::default(), 100)
    }

    #[test]
    fn test_cpu_usage_from_tick_delta() {
        assert!((cpu_usage(1000, 1050, 100) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_usage_idle_and_backwards() {
        assert_eq!(cpu_usage(1000, 1000, 100), 0.0);
        // A counter that went backwards (PID reuse) reads as idle
        assert_eq!(cpu_usage(1000, 10, 100), 0.0);
        assert_eq!(cpu_usage(0, 10, 0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_max_iterations() {
        let sampler = FakeSampler::new(vec![]);
        let mut m = monitor(test_config(), sampler);

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(outcome.reason, StopReason::MaxIterations);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(outcome.elapsed, Duration::from_secs(8));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(m.sampler.memory_reads.get(), 4);
        assert!(m.terminator.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_equal_does_not_react() {
        let sampler = FakeSampler::new(vec![Ok(10240), Ok(10240), Ok(10240), Ok(10240)]);
        let mut m = monitor(test_config(), sampler);

        let outcome = m.run().await;

        assert_eq!(outcome.reason, StopReason::MaxIterations);
        assert!(m.terminator.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_plus_one_sends_single_sigterm() {
        let sampler = FakeSampler::new(vec![Ok(100), Ok(10241), Ok(20000)]);
        let mut m = monitor(test_config(), sampler);

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(
            outcome.reason,
            StopReason::ThresholdExceeded {
                rss_kb: 10241,
                delivered: true
            }
        );
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(m.terminator.calls, vec![4242]);
        assert_eq!(m.state().signals_sent, 1);
        // Nothing is sampled after reacting
        assert_eq!(m.sampler.memory_reads.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_failure_still_completes() {
        let sampler = FakeSampler::new(vec![Ok(99999)]);
        let mut m = MonitorLoop::new(
            test_config(),
            sampler,
            FakeTerminator {
                calls: vec![],
                fail: true,
            },
            100,
        );

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(
            outcome.reason,
            StopReason::ThresholdExceeded {
                rss_kb: 99999,
                delivered: false
            }
        );
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(m.terminator.calls.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborts_on_ninth_consecutive_failure() {
        let failures = (0..9).map(|_| Err(unavailable())).collect();
        let sampler = FakeSampler::new(failures);
        let config = MonitorConfig {
            max_iterations: 256,
            ..test_config()
        };
        let mut m = monitor(config, sampler);

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Aborted);
        assert_eq!(outcome.reason, StopReason::ReadFailures { failures: 9 });
        assert_eq!(outcome.iterations, 9);
        assert_ne!(outcome.exit_code(), 0);
        assert_eq!(m.sampler.memory_reads.get(), 9);
        assert!(m.terminator.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let mut script: Vec<Result<u64, ReadError>> = (0..8).map(|_| Err(unavailable())).collect();
        script.push(Ok(500));
        script.extend((0..8).map(|_| Err(unavailable())));
        let sampler = FakeSampler::new(script);
        let config = MonitorConfig {
            max_iterations: 17,
            ..test_config()
        };
        let mut m = monitor(config, sampler);

        let outcome = m.run().await;

        // 8 failures, success, 8 failures: the ceiling is never exceeded
        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(outcome.reason, StopReason::MaxIterations);
        assert_eq!(m.state().consecutive_read_failures(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_below_ceiling_complete_normally() {
        let failures = (0..4).map(|_| Err(unavailable())).collect();
        let sampler = FakeSampler::new(failures);
        let mut m = monitor(test_config(), sampler);

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(m.state().consecutive_read_failures(), 4);
    }

    #[test]
    fn test_evaluate_memory_resets_after_success() {
        let mut m = monitor(test_config(), FakeSampler::new(vec![]));
        for _ in 0..5 {
            assert_eq!(m.evaluate_memory(Err(unavailable())), CycleDecision::Skip);
        }
        assert_eq!(m.state().consecutive_read_failures(), 5);

        assert_eq!(m.evaluate_memory(Ok(1)), CycleDecision::Continue);
        assert_eq!(m.state().consecutive_read_failures(), 0);
    }

    #[test]
    fn test_evaluate_memory_zero_rss_is_a_sample() {
        let mut m = monitor(test_config(), FakeSampler::new(vec![]));
        m.evaluate_memory(Err(unavailable()));
        assert_eq!(m.evaluate_memory(Ok(0)), CycleDecision::Continue);
        assert_eq!(m.state().consecutive_read_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_sampling_keeps_cycle_length() {
        let sampler = FakeSampler::new(vec![]).with_ticks(vec![
            Ok(1000),
            Ok(1050),
            Ok(1050),
            Ok(1150),
        ]);
        let config = MonitorConfig {
            max_iterations: 2,
            sample_cpu: true,
            ..test_config()
        };
        let mut m = monitor(config, sampler);
        let start = tokio::time::Instant::now();

        let outcome = m.run().await;

        assert_eq!(outcome.reason, StopReason::MaxIterations);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(m.sampler.tick_reads.get(), 4);
        assert_eq!(m.state().last_cpu_ticks, Some(1150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_without_cpu_sleep_full_interval() {
        let sampler = FakeSampler::new(vec![]);
        let config = MonitorConfig {
            max_iterations: 3,
            refresh_interval: Duration::from_secs(2),
            sample_cpu: false,
            ..test_config()
        };
        let mut m = monitor(config, sampler);
        let start = tokio::time::Instant::now();

        let outcome = m.run().await;

        assert_eq!(outcome.reason, StopReason::MaxIterations);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(m.sampler.memory_reads.get(), 3);
        assert_eq!(m.sampler.tick_reads.get(), 0);
    }

    #[test]
    fn test_failed_read_logs_single_warning() {
        let logs = CapturedLogs::default();
        let mut m = monitor(test_config(), FakeSampler::new(vec![]));

        tracing::subscriber::with_default(logs.subscriber(), || {
            m.evaluate_memory(Err(unavailable()));
        });

        let text = logs.text();
        let warnings: Vec<&str> = text.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 1, "{text}");
        // The read error itself is carried in that one line
        assert!(warnings[0].contains("/proc/4242/status"), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_window_longer_than_interval() {
        let sampler = FakeSampler::new(vec![]);
        let config = MonitorConfig {
            max_iterations: 3,
            refresh_interval: Duration::from_millis(500),
            sample_cpu: true,
            ..test_config()
        };
        let mut m = monitor(config, sampler);
        let start = tokio::time::Instant::now();

        m.run().await;

        // Remainder floors at zero, so each cycle is the 1s window
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_failure_is_not_counted() {
        let sampler = FakeSampler::new(vec![]).with_ticks(vec![
            Err(unavailable()),
            Ok(10),
            Ok(10),
            Err(unavailable()),
        ]);
        let config = MonitorConfig {
            max_iterations: 2,
            max_read_retries: 0,
            sample_cpu: true,
            ..test_config()
        };
        let mut m = monitor(config, sampler);
        let start = tokio::time::Instant::now();

        let outcome = m.run().await;

        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(m.state().last_cpu_ticks, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_cycle_sleeps_full_interval() {
        let sampler = FakeSampler::new(vec![Err(unavailable())]);
        let config = MonitorConfig {
            max_iterations: 1,
            sample_cpu: true,
            ..test_config()
        };
        let mut m = monitor(config, sampler);
        let start = tokio::time::Instant::now();

        m.run().await;

        assert_eq!(start.elapsed(), Duration::from_secs(2));
        // A failed memory read skips the CPU window entirely
        assert_eq!(m.sampler.tick_reads.get(), 0);
    }
}
