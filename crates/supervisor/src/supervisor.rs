use std::sync::Arc;
use std::time::Instant;
use log::{error, info, warn};
use crate::config::SupervisorConfig;
use crate::gpu::GpuInventory;
use crate::retry::{decide, Action, AttemptReport, Invocation, RetryPolicy, RetryReason, RetryState};
use crate::runner::{self, run_attempt};
use crate::sample::Sample;
use crate::telemetry::{Event, Telemetry};

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    /// Failure reason, or the tolerated error on success; empty otherwise
    pub reason: String,
    /// Number of ffmpeg attempts made
    pub attempts: u32,
    pub retry: u32,
    /// Arguments of the final attempt
    pub invocation: Invocation,
    pub last: Sample,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

/// Runs ffmpeg, retrying with adjusted arguments on known recoverable failures.
///
/// Each attempt starts from scratch; only the retry counter and the
/// (possibly rewritten) arguments survive into the next one.
pub struct Supervisor<G> {
    cfg: SupervisorConfig,
    gpu: Arc<G>,
    telemetry: Telemetry,
    started: Instant,
}

impl<G: GpuInventory + 'static> Supervisor<G> {
    pub fn new(cfg: SupervisorConfig, gpu: G, telemetry: Telemetry) -> Self {
        Supervisor {
            cfg,
            gpu: Arc::new(gpu),
            telemetry,
            started: Instant::now(),
        }
    }

    pub async fn run(&self, args: Vec<String>) -> Outcome {
        let mut invocation = Invocation::new(args);
        let mut state = RetryState { retry: self.cfg.retry };
        let policy = RetryPolicy::from(&self.cfg);

        match runner::preflight(&self.cfg.ffmpeg_bin) {
            Ok(path) => info!("Using ffmpeg at {}", path.display()),
            Err(e) => return self.fail(e.to_string(), 0, state, invocation, Sample::default()),
        }
        if let Some(frames) = invocation.extra_hw_frames() {
            self.telemetry.emit(
                Event::info("gpu")
                    .action("bootstrap")
                    .field("extra_hw_frames", frames)
                    .msg("detected -extra_hw_frames arg"),
            );
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let attempt = match run_attempt(&self.cfg, &invocation, self.gpu.clone(), &self.telemetry, attempts).await {
                Ok(attempt) => attempt,
                Err(e) => return self.fail(e.to_string(), attempts, state, invocation, Sample::default()),
            };
            // stalls and freezes are terminal
            if attempt.abort.is_some() {
                let reason = attempt.report.failure.unwrap_or_default();
                return self.fail(reason, attempts, state, invocation, attempt.last);
            }

            let decision = decide(&invocation, state, &attempt.report, &policy);
            match decision.action {
                Action::Done { tolerated } => {
                    return self.done(tolerated, attempts, decision.state, decision.invocation, attempt.last);
                }
                Action::Fail { reason } => {
                    return self.fail(reason, attempts, decision.state, decision.invocation, attempt.last);
                }
                Action::Retry { reason, backoff } => {
                    self.alert(reason, &attempt.report, decision.state, &policy);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    invocation = decision.invocation;
                    state = decision.state;
                }
            }
        }
    }

    fn alert(&self, reason: RetryReason, report: &AttemptReport, next: RetryState, policy: &RetryPolicy) {
        let base = Event::error("gpu")
            .action("alert")
            .field("retry", next.retry)
            .field("max_retry", policy.max_retry)
            .field("err", report.failure.as_deref());

        let event = match reason {
            RetryReason::FilterRewrite => base
                .field("subject", "filterbug")
                .field("details", "gpu filter bug")
                .msg("filterbug"),
            RetryReason::VramOverflow => base
                .field("subject", "oom")
                .field("details", "gpu out of vram")
                .msg(format!("retry: gpu OOM: {:?}", report.error_tail)),
            RetryReason::HwFrames { extra_hw_frames } => base
                .field("subject", "retry")
                .field("details", "extra_hw_frames")
                .field("extra_hw_frames", extra_hw_frames)
                .msg("increment extra_hw_frames and retry"),
        };
        warn!("Retrying ffmpeg ({:?}), retry {}", reason, next.retry);
        self.telemetry.emit(event);
    }

    fn done(
        &self,
        tolerated: Option<String>,
        attempts: u32,
        state: RetryState,
        invocation: Invocation,
        last: Sample,
    ) -> Outcome {
        if let Some(msg) = &tolerated {
            self.telemetry
                .emit(Event::warn("status").msg(format!("non fatal error: {}", msg)));
        }
        self.telemetry.emit(
            Event::info("summary")
                .action("done")
                .field("progress", 100)
                .field("uptime", self.started.elapsed().as_secs_f64())
                .field("attempts", attempts)
                .fields(last.fields())
                .msg("done"),
        );
        info!("ffmpeg finished after {} attempt(s)", attempts);
        Outcome {
            success: true,
            reason: tolerated.unwrap_or_default(),
            attempts,
            retry: state.retry,
            invocation,
            last,
        }
    }

    fn fail(
        &self,
        reason: String,
        attempts: u32,
        state: RetryState,
        invocation: Invocation,
        last: Sample,
    ) -> Outcome {
        self.telemetry.emit(
            Event::fatal("summary")
                .action("failed")
                .field("err", &reason)
                .field("progress", -100)
                .field("attempts", attempts)
                .msg(format!("failed: {:?}", reason)),
        );
        error!("ffmpeg failed after {} attempt(s): {}", attempts, reason);
        Outcome {
            success: false,
            reason,
            attempts,
            retry: state.retry,
            invocation,
            last,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::gpu::StaticInventory;
    use crate::telemetry::MemorySink;

    fn sh_config() -> SupervisorConfig {
        SupervisorConfig {
            ffmpeg_bin: PathBuf::from("sh"),
            status_interval_secs: 0.05,
            vram_backoff_secs: 0,
            ..Default::default()
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn supervise(cfg: SupervisorConfig, argv: Vec<String>) -> (Outcome, Vec<Event>) {
        let sink = Arc::new(MemorySink::default());
        let supervisor = Supervisor::new(cfg, StaticInventory::default(), Telemetry::new(sink.clone()));
        let outcome = supervisor.run(argv).await;
        (outcome, sink.events())
    }

    fn summaries(events: &[Event]) -> Vec<&Event> {
        events.iter().filter(|e| e.topic == "summary").collect()
    }

    #[tokio::test]
    async fn test_success() {
        let (outcome, events) = supervise(
            sh_config(),
            args(&["-c", "printf 'frame=   12 fps=12 q=28.0 size=       4kB time=00:00:00.48 bitrate=  68.3kbits/s speed=0.9x\\n' >&2"]),
        )
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.last.frame, 12);

        let summary = summaries(&events);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].action.as_deref(), Some("done"));
        assert_eq!(summary[0].fields["progress"], 100);
        assert_eq!(summary[0].fields["frame"], 12);
    }

    #[tokio::test]
    async fn test_tolerated_error_on_zero_exit() {
        let argv = args(&["-c", "echo 'Error while decoding stream #0:1: Invalid data' >&2; exit 0"]);
        let (outcome, events) = supervise(sh_config(), argv.clone()).await;
        assert!(outcome.success);
        assert_eq!(outcome.reason, "Error while decoding stream #0:1: Invalid data");
        assert!(events.iter().any(|e| e.level == crate::telemetry::Level::Warn && e.msg.starts_with("non fatal error")));

        let strict = SupervisorConfig { strict_errors: true, ..sh_config() };
        let (outcome, _) = supervise(strict, argv).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code(), 1);
        assert!(outcome.reason.contains("zero exit code"));
    }

    #[tokio::test]
    async fn test_vram_retry_budget() {
        let cfg = SupervisorConfig { max_retry: 2, ..sh_config() };
        let (outcome, events) = supervise(
            cfg,
            args(&["-c", "echo 'CUDA_ERROR_OUT_OF_MEMORY' >&2; echo 'Error opening output file' >&2; exit 1"]),
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retry, 2);
        assert!(outcome.reason.starts_with("max retry reached: gpu OOM"));
        assert!(outcome.reason.contains("Error opening output file"));

        let alerts = events.iter().filter(|e| e.topic == "gpu" && e.fields.get("subject") == Some(&"oom".into())).count();
        assert_eq!(alerts, 2);
        assert_eq!(summaries(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_filter_rewrite_retry() {
        let script = "case \"$1\" in *format=nv12,hwupload*) \
                      echo \"Impossible to convert between the formats supported by the filter 'a' and the filter 'b'\" >&2; exit 1;; \
                      esac; exit 0";
        let (outcome, events) = supervise(
            sh_config(),
            args(&["-c", script, "-vf", "format=nv12,hwupload,scale_npp=1280:720"]),
        )
        .await;
        assert!(outcome.success, "{}", outcome.reason);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.invocation.args()[3], "scale_npp=1280:720");
        assert_eq!(outcome.invocation.args()[..3], args(&["-c", script, "-vf"])[..]);
        assert!(events.iter().any(|e| e.fields.get("subject") == Some(&"filterbug".into())));
    }

    #[tokio::test]
    async fn test_hw_frames_retry() {
        let script = "if [ \"$1\" -lt 3 ]; then echo '[h264 @ 0x1] No decoder surfaces left' >&2; exit 1; fi; exit 0";
        let (outcome, _) = supervise(sh_config(), args(&["-c", script, "-extra_hw_frames", "1"])).await;
        assert!(outcome.success, "{}", outcome.reason);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.invocation.extra_hw_frames(), Some(3));

        let capped = SupervisorConfig { max_extra_hw_frames: 2, ..sh_config() };
        let (outcome, _) = supervise(capped, args(&["-c", script, "-extra_hw_frames", "1"])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_stall_is_not_retried() {
        let cfg = SupervisorConfig { max_stall: 1, ..sh_config() };
        let script = "echo 'CUDA_ERROR_OUT_OF_MEMORY' >&2; \
                      for i in 1 2 3 4; do printf \"frame=    9 fps=1 size=${i}kB\\r\" >&2; done; exec sleep 30";
        let (outcome, events) = supervise(cfg, args(&["-c", script])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.reason, "stalled on frame 9 after 2 updates");
        assert_eq!((outcome.last.frame, outcome.last.size), (9, 3));
        let summary = summaries(&events);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].action.as_deref(), Some("failed"));
        assert!(events.iter().any(|e| e.topic == "transcode" && e.action.as_deref() == Some("stop")));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let cfg = SupervisorConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ..sh_config()
        };
        let (outcome, events) = supervise(cfg, args(&["-i", "in.mkv", "out.mkv"])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.reason.contains("not found"));
        assert_eq!(summaries(&events)[0].action.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_initial_retry_counter_counts_against_budget() {
        let cfg = SupervisorConfig { retry: 5, max_retry: 5, ..sh_config() };
        let (outcome, _) = supervise(cfg, args(&["-c", "echo 'CUDA_ERROR_OUT_OF_MEMORY' >&2; exit 1"])).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
    }
}
