use std::sync::Arc;
use log::{debug, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use crate::gpu::GpuInventory;
use crate::normalize::CrToLf;
use crate::sample::{Sample, SampleDecoder};

/// Failure signatures seen at least once during one ffmpeg run. Flags only go false -> true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConditionFlags {
    /// The hardware decoder ran out of surfaces (`-extra_hw_frames` too small)
    pub hw_frames_exhausted: bool,
    /// The GPU ran out of memory or refused an encode session
    pub vram_overflow: bool,
    /// A filter chain could not negotiate formats
    pub filter_incompatible: bool,
}

impl ConditionFlags {
    pub fn any(&self) -> bool {
        self.hw_frames_exhausted || self.vram_overflow || self.filter_incompatible
    }
}

/// Raw signature matched on a single stderr line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    HwFramesExhausted,
    VramOverflow,
    /// `CUDA_ERROR_NO_DEVICE` only counts as overflow when GPUs are actually present
    NoDevice,
    FilterIncompatible,
}

pub const HW_FRAMES_MARKER: &str = "No decoder surfaces left";
pub const FILTER_MARKER: &str = "Impossible to convert between the formats supported by the filter";

/// Every signature present on `line`
pub fn signatures(line: &str) -> Vec<Signature> {
    let mut found = Vec::new();
    if line.contains(HW_FRAMES_MARKER) {
        found.push(Signature::HwFramesExhausted);
    }
    let nvenc = line.contains("nvenc");
    if (nvenc && line.contains("OpenEncodeSessionEx failed"))
        || (nvenc && line.contains("out of memory"))
        || line.contains("CUDA_ERROR_OUT_OF_MEMORY")
    {
        found.push(Signature::VramOverflow);
    } else if line.contains("CUDA_ERROR_NO_DEVICE") {
        found.push(Signature::NoDevice);
    }
    if line.contains(FILTER_MARKER) {
        found.push(Signature::FilterIncompatible);
    }
    found
}

/// Scans ffmpeg's stderr, emits samples that move forward, and records failure signatures
pub struct ProgressSampler<G> {
    decoder: SampleDecoder,
    gpu: Arc<G>,
    flags: ConditionFlags,
    last: Sample,
}

impl<G: GpuInventory> ProgressSampler<G> {
    pub fn new(decoder: SampleDecoder, gpu: Arc<G>) -> Self {
        ProgressSampler {
            decoder,
            gpu,
            flags: ConditionFlags::default(),
            last: Sample::default(),
        }
    }

    pub fn flags(&self) -> ConditionFlags {
        self.flags
    }

    /// Process one line. Returns the new sample if its frame count or size advanced.
    pub async fn observe(&mut self, line: &str) -> Option<Sample> {
        for sig in signatures(line) {
            self.raise(sig).await;
        }

        debug!("watch: state: {}", line);
        let next = self.decoder.decode(&self.last, line);
        if !next.advances(&self.last) {
            return None;
        }
        self.last = next;
        Some(next)
    }

    async fn raise(&mut self, sig: Signature) {
        match sig {
            Signature::HwFramesExhausted => {
                if !self.flags.hw_frames_exhausted {
                    warn!("hardware decoder surfaces exhausted");
                    self.flags.hw_frames_exhausted = true;
                }
            }
            Signature::FilterIncompatible => {
                if !self.flags.filter_incompatible {
                    warn!("filter format negotiation failed");
                    self.flags.filter_incompatible = true;
                }
            }
            Signature::VramOverflow => {
                if !self.flags.vram_overflow {
                    self.flags.vram_overflow = true;
                    self.annotate_oom().await;
                }
            }
            Signature::NoDevice => {
                if !self.flags.vram_overflow && !self.gpu.query().await.is_empty() {
                    self.flags.vram_overflow = true;
                    self.annotate_oom().await;
                }
            }
        }
    }

    async fn annotate_oom(&self) {
        let gpus = self.gpu.query().await;
        if gpus.is_empty() {
            warn!("gpu out of memory condition (no gpu inventory available)");
        }
        for (i, g) in gpus.iter().enumerate() {
            warn!(
                "gpu out of memory condition: gpu_num={} gpu_mem_used={} gpu_mem_total={} gpu_name={} gpu_pci={} gpu_driver={}",
                i, g.used, g.total, g.name, g.pci, g.driver
            );
        }
    }

    /// Watch `reader` until it closes, pushing accepted samples into `tx`.
    /// Returns the condition flags observed over the whole stream.
    pub async fn watch<R>(mut self, reader: R, tx: mpsc::Sender<Sample>) -> ConditionFlags
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(CrToLf::new(reader));
        let mut buf = Vec::new();
        let mut receiver_open = true;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("stderr watch failed: {}", e);
                    break;
                }
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf);
            if let Some(sample) = self.observe(&line).await {
                // keep draining after the receiver goes away so the writer never blocks
                if receiver_open && tx.send(sample).await.is_err() {
                    receiver_open = false;
                }
            }
        }

        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuInfo, StaticInventory};
    use proptest::prelude::*;

    fn sampler(gpus: Vec<GpuInfo>) -> ProgressSampler<StaticInventory> {
        ProgressSampler::new(SampleDecoder::default(), Arc::new(StaticInventory(gpus)))
    }

    fn t4() -> GpuInfo {
        GpuInfo {
            name: "TeslaT4".into(),
            pci: "00000000:00:1E.0".into(),
            driver: "535".into(),
            used: 90,
            total: 15360,
        }
    }

    async fn watch_all(input: &'static [u8], gpus: Vec<GpuInfo>) -> (Vec<Sample>, ConditionFlags) {
        let (tx, mut rx) = mpsc::channel(1000);
        let flags = sampler(gpus).watch(input, tx).await;
        let mut samples = Vec::new();
        while let Some(s) = rx.recv().await {
            samples.push(s);
        }
        (samples, flags)
    }

    #[test]
    fn test_signatures() {
        assert_eq!(signatures("[h264 @ 0x1] No decoder surfaces left"), vec![Signature::HwFramesExhausted]);
        assert_eq!(signatures("[h264_nvenc @ 0x1] OpenEncodeSessionEx failed: out of memory (10)"), vec![Signature::VramOverflow]);
        assert_eq!(signatures("[hevc_nvenc @ 0x1] out of memory"), vec![Signature::VramOverflow]);
        assert_eq!(signatures("cu->cuCtxCreate failed -> CUDA_ERROR_OUT_OF_MEMORY"), vec![Signature::VramOverflow]);
        assert_eq!(signatures("cu->cuInit(0) failed -> CUDA_ERROR_NO_DEVICE"), vec![Signature::NoDevice]);
        assert_eq!(
            signatures("Impossible to convert between the formats supported by the filter 'Parsed_null_0' and the filter 'auto_scale_0'"),
            vec![Signature::FilterIncompatible]
        );
        assert!(signatures("[libx264 @ 0x1] out of memory").is_empty());
        assert!(signatures("frame=  10 fps=0.0 size=1kB").is_empty());
    }

    #[tokio::test]
    async fn test_watch_emits_only_advancing_samples() {
        let input: &[u8] = b"Input #0, matroska\n\
            frame=    1 fps=0.0 q=0.0 size=       0kB time=00:00:00.04 bitrate=N/A speed=N/A\r\
            frame=    1 fps=0.0 q=0.0 size=       0kB time=00:00:00.04 bitrate=N/A speed=N/A\r\
            frame=    5 fps=0.0 q=28.0 size=       1kB time=00:00:00.20 bitrate= 40.0kbits/s speed=0.4x\r\
            frame=    5 fps=0.0 q=28.0 size=       2kB time=00:00:00.20 bitrate= 80.0kbits/s speed=0.4x\r\
            frame=    4 fps=0.0 q=28.0 size=       2kB time=00:00:00.16 bitrate= 80.0kbits/s speed=0.4x\r\
            [out#0/null @ 0x1] video:1kB\n";
        let (samples, flags) = watch_all(input, vec![]).await;
        let frames: Vec<(u64, u64)> = samples.iter().map(|s| (s.frame, s.size)).collect();
        assert_eq!(frames, vec![(1, 0), (5, 1), (5, 2)]);
        assert_eq!(flags, ConditionFlags::default());
    }

    #[tokio::test]
    async fn test_watch_sets_flags() {
        let input: &[u8] = b"[h264 @ 0x1] No decoder surfaces left\n\
            Impossible to convert between the formats supported by the filter 'a' and the filter 'b'\n";
        let (samples, flags) = watch_all(input, vec![]).await;
        assert!(samples.is_empty());
        assert!(flags.hw_frames_exhausted);
        assert!(flags.filter_incompatible);
        assert!(!flags.vram_overflow);
        assert!(flags.any());
    }

    #[tokio::test]
    async fn test_cuda_oom_sets_flag_once() {
        let mut s = sampler(vec![]);
        assert!(s.observe("CUDA_ERROR_OUT_OF_MEMORY").await.is_none());
        assert!(s.flags().vram_overflow);
        let before = s.flags();
        assert!(s.observe("CUDA_ERROR_OUT_OF_MEMORY").await.is_none());
        assert_eq!(s.flags(), before);
        assert!(!s.flags().hw_frames_exhausted && !s.flags().filter_incompatible);
    }

    #[tokio::test]
    async fn test_no_device_requires_gpu_inventory() {
        let mut without = sampler(vec![]);
        without.observe("CUDA_ERROR_NO_DEVICE").await;
        assert!(!without.flags().vram_overflow);

        let mut with = sampler(vec![t4()]);
        with.observe("CUDA_ERROR_NO_DEVICE").await;
        assert!(with.flags().vram_overflow);
    }

    #[tokio::test]
    async fn test_watch_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input: &[u8] = b"frame=1 size=1kB\nframe=2 size=2kB\nNo decoder surfaces left\n";
        let flags = sampler(vec![]).watch(input, tx).await;
        assert!(flags.hw_frames_exhausted);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_emitted_iff_frame_or_size_advances(
            steps in prop::collection::vec((0u64..50, 0u64..50), 1..60)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let mut s = sampler(vec![]);
                let mut last = Sample::default();
                for (frame, size) in steps {
                    let line = format!("frame={:>5} fps=25 q=28.0 size={:>8}kB time=00:00:01.00 bitrate=1.0kbits/s speed=1x", frame, size);
                    let expected = frame > last.frame || size > last.size;
                    let got = s.observe(&line).await;
                    assert_eq!(got.is_some(), expected);
                    if let Some(sample) = got {
                        last = sample;
                    }
                }
            });
        }
    }
}
