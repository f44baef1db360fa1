use std::fmt;
use std::time::Duration;
use serde_json::{json, Map, Value};

/// One progress snapshot decoded from ffmpeg's status line, e.g.
/// `frame=  100 fps= 25 q=28.0 size=     256kB time=00:00:04.00 bitrate= 524.3kbits/s dup=0 drop=0 speed=1.01x`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub frame: u64,
    /// Scaled by the output multiplier
    pub fps: u64,
    pub q: f64,
    pub time: Timestamp,
    /// KiB
    pub size: u64,
    /// kbit/s
    pub bitrate: f64,
    pub dup: u64,
    pub drop: u64,
    /// Scaled by the output multiplier, two decimals
    pub speed: f64,
}

impl Sample {
    /// Fraction of the job done. Uses the encoded timestamp when a duration target is set,
    /// otherwise the frame count. Not clamped above 1.
    pub fn progress(&self, target_duration: Duration, target_frames: u64) -> f64 {
        if !target_duration.is_zero() {
            return self.time.as_duration().as_secs_f64() / target_duration.as_secs_f64();
        }
        if target_frames != 0 {
            return self.frame as f64 / target_frames as f64;
        }
        0.0
    }

    /// Whole percent, never negative
    pub fn percent(&self, target_duration: Duration, target_frames: u64) -> i64 {
        let perc = (self.progress(target_duration, target_frames) * 100.0) as i64;
        perc.max(0)
    }

    /// Whether this sample moved forward relative to `prior`
    pub fn advances(&self, prior: &Sample) -> bool {
        self.frame > prior.frame || self.size > prior.size
    }

    /// Telemetry fields for status and summary events
    pub fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("frame".into(), json!(self.frame));
        map.insert("runtime".into(), json!(self.time.as_duration().as_secs_f64()));
        map.insert("size".into(), json!(self.size.saturating_mul(1024)));
        map.insert("dup".into(), json!(self.dup));
        map.insert("drop".into(), json!(self.drop));
        map.insert("bps".into(), json!((self.bitrate * 1000.0).round() as i64));
        map.insert("fps".into(), json!(self.fps));
        map.insert("speed".into(), json!(format!("{:.2}", self.speed)));
        map.insert("q".into(), json!(self.q));
        map
    }
}

/// Encoded timestamp as printed by ffmpeg (`H:MM:SS.ss`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// Lenient parse: each component is a float, parsing stops at the first bad component,
    /// and anything negative or unreadable (`N/A`) collapses to zero.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.starts_with('-') {
            return Timestamp(Duration::ZERO);
        }
        let mut parts = [0.0f64; 3];
        for (slot, component) in parts.iter_mut().zip(s.split(':')) {
            match scan_float(component) {
                Some(v) => *slot = v,
                None => break,
            }
        }
        let [h, m, sec] = parts;
        let secs = 3600.0 * h + 60.0 * m + sec;
        if !(secs.is_finite() && secs > 0.0) {
            return Timestamp(Duration::ZERO);
        }
        Timestamp(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let centis = self.0.as_millis() / 10;
        let h = centis / 360_000;
        let m = (centis / 6_000) % 60;
        let s = (centis / 100) % 60;
        let cs = centis % 100;
        write!(f, "{:02}:{:02}:{:02}.{:02}", h, m, s, cs)
    }
}

/// Keys of the status line we care about. Anything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Frame,
    Fps,
    Q,
    Size,
    Time,
    Bitrate,
    Dup,
    Drop,
    Speed,
}

impl Key {
    fn parse(s: &str) -> Option<Key> {
        match s {
            "frame" => Some(Key::Frame),
            "fps" => Some(Key::Fps),
            "q" => Some(Key::Q),
            // ffmpeg prints Lsize on the final summary line
            "size" | "Lsize" => Some(Key::Size),
            "time" => Some(Key::Time),
            "bitrate" => Some(Key::Bitrate),
            "dup" => Some(Key::Dup),
            "drop" => Some(Key::Drop),
            "speed" => Some(Key::Speed),
            _ => None,
        }
    }
}

/// Turns status lines into samples
#[derive(Debug, Clone, Copy)]
pub struct SampleDecoder {
    outputs: u32,
}

impl Default for SampleDecoder {
    fn default() -> Self {
        SampleDecoder { outputs: 1 }
    }
}

impl SampleDecoder {
    /// `outputs` is the number of simultaneous outputs; 0 is treated as 1
    pub fn new(outputs: u32) -> Self {
        SampleDecoder { outputs: outputs.max(1) }
    }

    /// Decode `line` on top of `prev`. Lines that are not status lines (they must start with
    /// `frame=` for video or `size=` for audio/packaging) return `prev` unchanged. Fields absent
    /// from the line keep their previous value; malformed values decode as zero.
    pub fn decode(&self, prev: &Sample, line: &str) -> Sample {
        if !is_status_line(line) {
            return *prev;
        }

        let mut s = *prev;
        let tokens = demangle(line);
        for pair in tokens.chunks_exact(2) {
            let Some(key) = Key::parse(pair[0]) else {
                continue;
            };
            let value = pair[1];
            match key {
                Key::Frame => s.frame = scan_uint(value),
                Key::Fps => s.fps = scan_uint(value).saturating_mul(u64::from(self.outputs)),
                Key::Q => s.q = scan_float(value).unwrap_or(0.0),
                Key::Size => s.size = scan_uint(value),
                Key::Time => s.time = Timestamp::parse(value),
                Key::Bitrate => s.bitrate = scan_float(value).unwrap_or(0.0),
                Key::Dup => s.dup = scan_uint(value),
                Key::Drop => s.drop = scan_uint(value),
                Key::Speed => {
                    let speed = scan_float(value).unwrap_or(0.0) * f64::from(self.outputs);
                    s.speed = round100(speed);
                }
            }
        }
        s
    }
}

pub fn is_status_line(line: &str) -> bool {
    line.starts_with("frame=") || line.starts_with("size=")
}

/// ffmpeg left-pads numbers after the equals sign, so drop the separators and
/// treat the line as an alternating key/value token list.
fn demangle(line: &str) -> Vec<&str> {
    line.split('=').flat_map(str::split_whitespace).collect()
}

fn round100(f: f64) -> f64 {
    (f * 100.0).round() / 100.0
}

/// Leading unsigned integer of `token` (`256kB` -> 256). No digits or a negative value gives 0.
fn scan_uint(token: &str) -> u64 {
    let digits = token.strip_prefix('+').unwrap_or(token);
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    digits[..end].parse().unwrap_or(0)
}

/// Leading float of `token` (`38.2kbits/s` -> 38.2, `1.01x` -> 1.01, `N/A` -> None)
fn scan_float(token: &str) -> Option<f64> {
    let bytes = token.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut mantissa_digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        mantissa_digits += frac_end - frac_start;
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return None;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }
    token[..end].parse().ok()
}
