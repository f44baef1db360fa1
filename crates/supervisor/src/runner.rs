use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::error_tail;
use crate::gpu::GpuInventory;
use crate::retry::{AttemptReport, Invocation};
use crate::sample::{Sample, SampleDecoder};
use crate::sampler::ProgressSampler;
use crate::stall::{StallDetector, StallPolicy, Verdict};
use crate::telemetry::{Event, Telemetry};

/// Capacity of the accepted-sample channel
const SAMPLE_QUEUE: usize = 1000;
/// Buffer of the in-process pipe between the stderr tee and the watcher
const PIPE_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;

/// Result of one completed ffmpeg attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    pub report: AttemptReport,
    /// Last accepted sample
    pub last: Sample,
    /// Stall or freeze verdict that killed the process; such attempts are never retried
    pub abort: Option<Verdict>,
}

/// What the execution task hands back through the completion channel
struct Execution {
    status: SupervisorResult<ExitStatus>,
    /// Everything ffmpeg wrote to stderr. Owned by the execution task until it completes.
    captured: Vec<u8>,
}

/// Resolve the ffmpeg binary on PATH (or as given, if it contains a separator)
pub fn preflight(ffmpeg_bin: &Path) -> SupervisorResult<PathBuf> {
    which::which(ffmpeg_bin).map_err(|source| SupervisorError::NotFound {
        path: ffmpeg_bin.to_path_buf(),
        source,
    })
}

/// Percent progress of `sample` under the configured targets
pub fn percent(cfg: &SupervisorConfig, sample: &Sample) -> i64 {
    sample.percent(cfg.target_duration(), cfg.target_frames)
}

pub fn status_event(cfg: &SupervisorConfig, sample: &Sample) -> Event {
    Event::info("status")
        .action("update")
        .field("progress", percent(cfg, sample))
        .fields(sample.fields())
}

/// Run ffmpeg once and supervise it until it exits.
///
/// Stall and freeze conditions kill the process and come back in [`Attempt::abort`].
/// Any other exit, clean or not, comes back as an [`Attempt`] for the retry decision.
pub async fn run_attempt<G>(
    cfg: &SupervisorConfig,
    invocation: &Invocation,
    gpu: Arc<G>,
    telemetry: &Telemetry,
    attempt: u32,
) -> SupervisorResult<Attempt>
where
    G: GpuInventory + 'static,
{
    telemetry.emit(
        Event::info("transcode")
            .action("start")
            .field("attempt", attempt)
            .field("cmd", invocation.args())
            .msg(format!("cmd: {} {:?}", cfg.ffmpeg_bin.display(), invocation.args())),
    );
    info!("Starting ffmpeg attempt {}: {} {}", attempt, cfg.ffmpeg_bin.display(), invocation.command_line());

    let mut cmd = Command::new(&cfg.ffmpeg_bin);
    cmd.args(invocation.args())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        path: cfg.ffmpeg_bin.clone(),
        source,
    })?;
    let stderr = child.stderr.take().ok_or(SupervisorError::MissingStderr)?;
    let artifact = open_artifact(cfg.stderr_path.as_deref()).await;

    let cancel = CancellationToken::new();
    let (pipe_writer, pipe_reader) = tokio::io::duplex(PIPE_BUFFER);
    let (done_tx, mut done_rx) = oneshot::channel();
    let exec_cancel = cancel.clone();
    tokio::spawn(async move {
        let execution = execute(child, stderr, pipe_writer, artifact, exec_cancel).await;
        // the receiver only goes away if the supervising loop itself was dropped
        let _ = done_tx.send(execution);
    });

    let (sample_tx, mut sample_rx) = mpsc::channel(SAMPLE_QUEUE);
    let sampler = ProgressSampler::new(SampleDecoder::new(cfg.outputs), gpu);
    let watcher = tokio::spawn(sampler.watch(pipe_reader, sample_tx));

    let policy = StallPolicy {
        max_stall: cfg.max_stall,
        max_dup: cfg.max_dup,
    };
    let mut detector = StallDetector::new();
    let mut prior = Sample::default();
    let mut samples_open = true;
    let mut abort = None;
    let period = cfg.status_interval();
    let mut ticker = interval_at(Instant::now() + period, period);

    telemetry.emit(status_event(cfg, &prior));

    let completed = loop {
        tokio::select! {
            done = &mut done_rx => break done,
            next = sample_rx.recv(), if samples_open => {
                let Some(current) = next else {
                    samples_open = false;
                    continue;
                };
                let verdict = policy.check(&mut detector, &current);
                prior = current;
                if verdict != Verdict::Continue {
                    report_abort(telemetry, verdict, &prior, cfg);
                    cancel.cancel();
                    abort = Some(verdict);
                    // the watcher keeps draining the pipe into a closed channel
                    sample_rx.close();
                    samples_open = false;
                }
            }
            _ = ticker.tick() => {
                telemetry.emit(status_event(cfg, &prior));
            }
        }
    };

    let execution = completed.map_err(|_| SupervisorError::TaskFailed("ffmpeg execution"))?;

    // completion can overtake the last buffered samples
    if abort.is_none() {
        while let Some(current) = sample_rx.recv().await {
            prior = current;
        }
    }
    let flags = watcher
        .await
        .map_err(|_| SupervisorError::TaskFailed("stderr watcher"))?;

    let error_tail = error_tail::scan_bytes(&execution.captured);
    let failure = match &execution.status {
        _ if abort.is_some() => abort.and_then(Verdict::into_error).map(|e| e.to_string()),
        Ok(status) if status.success() => None,
        Ok(status) => Some(SupervisorError::ExitStatus { code: status.code().unwrap_or(-1) }.to_string()),
        Err(e) => Some(e.to_string()),
    };

    telemetry.emit(
        Event::info("transcode")
            .action("stop")
            .field("attempt", attempt)
            .field("err", failure.as_deref())
            .field("flags", flags),
    );
    debug!(
        "ffmpeg attempt {} finished: failure={:?} error_tail={:?} flags={:?}",
        attempt, failure, error_tail, flags
    );

    Ok(Attempt {
        report: AttemptReport {
            failure,
            error_tail,
            flags,
        },
        last: prior,
        abort,
    })
}

fn report_abort(telemetry: &Telemetry, verdict: Verdict, current: &Sample, cfg: &SupervisorConfig) {
    match verdict {
        Verdict::Frozen { frames, limit } => telemetry.emit(
            Event::error("dup")
                .field("frames", frames)
                .field("limit", limit)
                .field("fatal", true)
                .msg("freeze detected"),
        ),
        Verdict::Stalled { frame, updates } => telemetry.emit(
            Event::error("status")
                .action("stall")
                .field("frame", frame)
                .field("progress", percent(cfg, current))
                .msg(format!("stalled on frame {} after {} updates", frame, updates)),
        ),
        Verdict::Continue => return,
    }
    warn!("Killing ffmpeg: {:?}", verdict);
}

async fn open_artifact(path: Option<&Path>) -> Option<File> {
    let path = path?;
    match File::create(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Failed to open stderr file {}: {}, keeping stderr in memory only", path.display(), e);
            None
        }
    }
}

/// Tee ffmpeg's stderr into the capture buffer, the optional artifact file and the
/// watcher pipe, then wait for exit. Cancellation kills the process.
async fn execute(
    mut child: Child,
    mut stderr: ChildStderr,
    mut pipe: DuplexStream,
    mut artifact: Option<File>,
    cancel: CancellationToken,
) -> Execution {
    let mut captured = Vec::new();

    let copied = tokio::select! {
        r = tee(&mut stderr, &mut captured, &mut pipe, &mut artifact) => r,
        _ = cancel.cancelled() => {
            return Execution { status: kill(&mut child).await, captured };
        }
    };
    // closing the pipe ends the watcher
    drop(pipe);

    if let Err(e) = copied {
        warn!("ffmpeg stderr copy failed: {}", e);
        let _ = child.kill().await;
        return Execution {
            status: Err(SupervisorError::Capture(e)),
            captured,
        };
    }

    let status = tokio::select! {
        s = child.wait() => s.map_err(SupervisorError::Wait),
        _ = cancel.cancelled() => kill(&mut child).await,
    };
    Execution { status, captured }
}

async fn tee(
    stderr: &mut ChildStderr,
    captured: &mut Vec<u8>,
    pipe: &mut DuplexStream,
    artifact: &mut Option<File>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pipe_open = true;
    loop {
        let n = stderr.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        captured.extend_from_slice(chunk);
        if let Some(file) = artifact.as_mut() {
            if let Err(e) = file.write_all(chunk).await {
                warn!("Failed to write stderr file: {}", e);
                *artifact = None;
            }
        }
        if pipe_open && pipe.write_all(chunk).await.is_err() {
            pipe_open = false;
        }
    }
    if let Some(file) = artifact.as_mut() {
        if let Err(e) = file.flush().await {
            warn!("Failed to flush stderr file: {}", e);
        }
    }
    Ok(())
}

async fn kill(child: &mut Child) -> SupervisorResult<ExitStatus> {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill ffmpeg: {}", e);
    }
    Err(SupervisorError::Cancelled)
}
