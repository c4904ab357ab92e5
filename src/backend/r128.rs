use super::{BackendError, ComputeMode, GainComputer, GainPeak, GainResult, gain_from_loudness};
use crate::grouping::TrackSet;
use ebur128::{EbuR128, Mode};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// In-process backend: decode with symphonia, measure with libebur128's Rust port.
pub struct Ebur128Computer {
    mode: Mode,
}

impl Ebur128Computer {
    pub fn new() -> Self {
        Self {
            mode: Mode::I | Mode::SAMPLE_PEAK,
        }
    }

    /// Check that a meter can be built at all.
    pub fn probe() -> Result<Self, String> {
        let computer = Self::new();
        EbuR128::new(2, 48_000, computer.mode).map_err(|e| e.to_string())?;
        Ok(computer)
    }

    /// Decode one file into a loudness meter.
    fn measure(&self, path: &Path) -> Result<Measured, BackendError> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let unsupported = |message: String| BackendError::Unsupported {
            path: path.to_path_buf(),
            message,
        };
        let decode_err = |message: String| BackendError::Decode {
            path: path.to_path_buf(),
            message,
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| unsupported("no audio track".into()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let rate = params
            .sample_rate
            .ok_or_else(|| unsupported("stream has no sample rate".into()))?;
        let channels = params
            .channels
            .map(|c| c.count() as u32)
            .ok_or_else(|| unsupported("stream has no channel layout".into()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| unsupported(e.to_string()))?;

        let mut meter =
            EbuR128::new(channels, rate, self.mode).map_err(|e| unsupported(e.to_string()))?;

        // Reused across packets; rebuilt when a packet outgrows it.
        let mut buffer: Option<(usize, SampleBuffer<f32>)> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(decode_err(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    log::debug!("Skipping corrupt packet in {}: {}", path.display(), msg);
                    continue;
                }
                Err(e) => return Err(decode_err(e.to_string())),
            };

            let frames = decoded.capacity();
            let spec = *decoded.spec();
            if buffer.as_ref().is_none_or(|(cap, _)| *cap < frames) {
                buffer = Some((frames, SampleBuffer::new(frames as u64, spec)));
            }
            let Some((_, samples)) = buffer.as_mut() else {
                continue;
            };
            samples.copy_interleaved_ref(decoded);
            meter
                .add_frames_f32(samples.samples())
                .map_err(|e| decode_err(e.to_string()))?;
        }

        Ok(Measured { meter, channels })
    }

    fn peak(measured: &Measured, path: &Path) -> Result<f64, BackendError> {
        let mut peak = 0.0_f64;
        for ch in 0..measured.channels {
            let p = measured.meter.sample_peak(ch).map_err(|e| BackendError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            peak = peak.max(p);
        }
        Ok(peak)
    }
}

struct Measured {
    meter: EbuR128,
    channels: u32,
}

impl Default for Ebur128Computer {
    fn default() -> Self {
        Self::new()
    }
}

/// BS.1770 absolute gate. Anything quieter measures as negative infinity.
const SILENCE_LUFS: f64 = -70.0;

/// Gain for a measured loudness, with silence treated as sitting at the gate.
fn clamped_gain(lufs: f64) -> f64 {
    gain_from_loudness(lufs.max(SILENCE_LUFS))
}

impl GainComputer for Ebur128Computer {
    fn name(&self) -> &'static str {
        "ebur128"
    }

    fn compute_gain(&self, set: &TrackSet, mode: ComputeMode) -> Result<GainResult, BackendError> {
        let mut meters = Vec::with_capacity(set.len());
        let mut tracks = BTreeMap::new();

        for path in set.paths() {
            log::debug!("Measuring {}", path.display());
            let measured = self.measure(path)?;
            let lufs = measured.meter.loudness_global().map_err(|e| BackendError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            if lufs < SILENCE_LUFS || lufs.is_nan() {
                log::warn!("{} is silent; using the maximum gain", path.display());
            }
            let gain = clamped_gain(lufs);
            let peak = Self::peak(&measured, path)?;
            tracks.insert(path.to_path_buf(), GainPeak { gain, peak });
            meters.push(measured.meter);
        }

        let album = match mode {
            ComputeMode::TrackOnly => None,
            ComputeMode::TrackAndAlbum => {
                let lufs = EbuR128::loudness_global_multiple(meters.iter()).map_err(|e| {
                    BackendError::Decode {
                        path: set.directory().to_path_buf(),
                        message: e.to_string(),
                    }
                })?;
                let peak = tracks.values().map(|t| t.peak).fold(0.0_f64, f64::max);
                Some(GainPeak {
                    gain: clamped_gain(lufs),
                    peak,
                })
            }
        };

        Ok(GainResult { tracks, album })
    }
}
