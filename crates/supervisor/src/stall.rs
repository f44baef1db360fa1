use crate::error::SupervisorError;
use crate::sample::Sample;

/// Counts consecutive samples whose frame count failed to advance
#[derive(Debug, Clone, Default)]
pub struct StallDetector {
    prior: Sample,
    count: u64,
}

impl StallDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `sample` into the counter and return the new count.
    /// A zero frame count (audio-only or not started) never counts as a stall.
    pub fn observe(&mut self, sample: &Sample) -> u64 {
        if sample.frame <= self.prior.frame && sample.frame != 0 {
            self.count += 1;
        } else {
            self.count = 0;
        }
        self.prior = *sample;
        self.count
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// What the supervising loop should do after a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Frozen { frames: u64, limit: u64 },
    Stalled { frame: u64, updates: u64 },
}

impl Verdict {
    pub fn into_error(self) -> Option<SupervisorError> {
        match self {
            Verdict::Continue => None,
            Verdict::Frozen { frames, limit } => Some(SupervisorError::Frozen { frames, limit }),
            Verdict::Stalled { frame, updates } => Some(SupervisorError::Stalled { frame, updates }),
        }
    }
}

/// Stall and freeze thresholds. A `max_dup` of zero disables the freeze check.
/// `max_stall` of zero disables the stall check here, but configuration always
/// promotes it to the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct StallPolicy {
    pub max_stall: u64,
    pub max_dup: u64,
}

impl StallPolicy {
    /// Duplicate ceiling first, then the stall counter
    pub fn check(&self, detector: &mut StallDetector, sample: &Sample) -> Verdict {
        if self.max_dup > 0 && sample.dup >= self.max_dup {
            return Verdict::Frozen { frames: sample.dup, limit: self.max_dup };
        }
        let updates = detector.observe(sample);
        if self.max_stall > 0 && updates > self.max_stall {
            return Verdict::Stalled { frame: sample.frame, updates };
        }
        Verdict::Continue
    }
}
