use std::time::Duration;
use crate::config::SupervisorConfig;
use crate::sampler::ConditionFlags;

/// Filter chain that breaks some scale_npp builds, and its working equivalent
pub const FILTER_BUG_FRAGMENT: &str = "format=nv12,hwupload,scale_npp=";
pub const FILTER_BUG_REPLACEMENT: &str = "scale_npp=";

const EXTRA_HW_FRAMES_FLAG: &str = "-extra_hw_frames";
const VIDEO_FILTER_FLAG: &str = "-vf";

/// The ffmpeg argument vector for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    args: Vec<String>,
}

impl Invocation {
    pub fn new(args: Vec<String>) -> Self {
        Invocation { args }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Value following the last `-extra_hw_frames` flag. An unparseable value reads as 0.
    pub fn extra_hw_frames(&self) -> Option<u32> {
        self.extra_hw_frames_index()
            .map(|i| self.args[i].trim().parse().unwrap_or(0))
    }

    fn extra_hw_frames_index(&self) -> Option<usize> {
        (1..self.args.len())
            .rev()
            .find(|&i| self.args[i - 1] == EXTRA_HW_FRAMES_FLAG)
    }

    /// Copy with the tracked `-extra_hw_frames` value replaced; None if the flag is absent
    pub fn with_extra_hw_frames(&self, frames: u32) -> Option<Invocation> {
        let i = self.extra_hw_frames_index()?;
        let mut next = self.clone();
        next.args[i] = frames.to_string();
        Some(next)
    }

    /// Copy with the broken filter fragment rewritten in every `-vf` value;
    /// None if no `-vf` value contained it
    pub fn with_filter_fix(&self) -> Option<Invocation> {
        let mut next = self.clone();
        let mut changed = false;
        for i in 1..next.args.len() {
            if next.args[i - 1] == VIDEO_FILTER_FLAG && next.args[i].contains(FILTER_BUG_FRAGMENT) {
                next.args[i] = next.args[i].replace(FILTER_BUG_FRAGMENT, FILTER_BUG_REPLACEMENT);
                changed = true;
            }
        }
        changed.then_some(next)
    }
}

/// Carried from one attempt to the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retry: u32,
}

impl RetryState {
    pub fn next(self) -> Self {
        RetryState { retry: self.retry.saturating_add(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub strict_errors: bool,
    pub max_extra_hw_frames: u32,
    pub vram_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for RetryPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        RetryPolicy {
            max_retry: cfg.max_retry,
            strict_errors: cfg.strict_errors,
            max_extra_hw_frames: cfg.max_extra_hw_frames,
            vram_backoff: cfg.vram_backoff(),
        }
    }
}

/// Everything known about an attempt once ffmpeg has exited
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptReport {
    /// Why the attempt failed (non-zero exit, wait error); None on a clean exit
    pub failure: Option<String>,
    /// First fatal-looking stderr line, empty if none
    pub error_tail: String,
    pub flags: ConditionFlags,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Best human readable reason for a failure
    pub fn reason(&self) -> String {
        if !self.error_tail.is_empty() {
            return self.error_tail.clone();
        }
        self.failure.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// `-vf` rewritten to drop the broken upload chain
    FilterRewrite,
    /// GPU memory exhausted, same arguments after a backoff
    VramOverflow,
    /// `-extra_hw_frames` raised to the carried value
    HwFrames { extra_hw_frames: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Finished. `tolerated` holds a fatal-looking message that was downgraded to a warning.
    Done { tolerated: Option<String> },
    Retry { reason: RetryReason, backoff: Duration },
    Fail { reason: String },
}

/// Next invocation and retry state, plus what to do with them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub invocation: Invocation,
    pub state: RetryState,
    pub action: Action,
}

/// Decide what follows an attempt. Rules, in order:
///
/// 1. clean exit, no fatal stderr, no flags: done
/// 2. clean exit with fatal stderr but no flags: tolerated, or failed in strict mode
/// 3. filter incompatibility with the known bad `-vf` chain: rewrite it and retry (no budget)
/// 4. GPU memory overflow: back off and retry until the budget is spent
/// 5. decoder surfaces exhausted: raise `-extra_hw_frames` by one up to its ceiling
/// 6. anything else fails with the error tail as the reason
///
/// Rules 3-6 only apply to failed attempts; a clean exit is always resolved by 1-2.
pub fn decide(
    invocation: &Invocation,
    state: RetryState,
    report: &AttemptReport,
    policy: &RetryPolicy,
) -> Decision {
    let stay = |action| Decision {
        invocation: invocation.clone(),
        state,
        action,
    };
    let flags = report.flags;

    if report.succeeded() {
        if report.error_tail.is_empty() || flags.any() {
            return stay(Action::Done { tolerated: None });
        }
        if policy.strict_errors {
            return stay(Action::Fail {
                reason: format!("ffmpeg: zero exit code but parsed fatal error: {}", report.error_tail),
            });
        }
        return stay(Action::Done { tolerated: Some(report.error_tail.clone()) });
    }

    if flags.filter_incompatible && invocation.command_line().contains(FILTER_BUG_FRAGMENT) {
        if let Some(fixed) = invocation.with_filter_fix() {
            return Decision {
                invocation: fixed,
                state: state.next(),
                action: Action::Retry {
                    reason: RetryReason::FilterRewrite,
                    backoff: Duration::ZERO,
                },
            };
        }
    }

    if flags.vram_overflow {
        if state.retry >= policy.max_retry {
            return stay(Action::Fail {
                reason: format!("max retry reached: gpu OOM: {:?}", report.reason()),
            });
        }
        return Decision {
            invocation: invocation.clone(),
            state: state.next(),
            action: Action::Retry {
                reason: RetryReason::VramOverflow,
                backoff: policy.vram_backoff,
            },
        };
    }

    if flags.hw_frames_exhausted {
        if let Some(current) = invocation.extra_hw_frames() {
            if current < policy.max_extra_hw_frames {
                let extra_hw_frames = current + 1;
                if let Some(next) = invocation.with_extra_hw_frames(extra_hw_frames) {
                    return Decision {
                        invocation: next,
                        state: state.next(),
                        action: Action::Retry {
                            reason: RetryReason::HwFrames { extra_hw_frames },
                            backoff: Duration::ZERO,
                        },
                    };
                }
            }
        }
    }

    stay(Action::Fail { reason: report.reason() })
}
