pub mod bs1770gain;
pub mod r128;

use crate::grouping::TrackSet;
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// ReplayGain 2.0 reference level in LUFS.
pub const REFERENCE_LUFS: f64 = -18.0;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("could not decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("unsupported file {path}: {message}")]
    Unsupported { path: PathBuf, message: String },
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },
    #[error("unreadable report from {tool}: {message}")]
    Report { tool: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to compute for a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    TrackOnly,
    TrackAndAlbum,
}

/// Gain in dB relative to the reference level, peak as linear amplitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainPeak {
    pub gain: f64,
    pub peak: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GainResult {
    pub tracks: BTreeMap<PathBuf, GainPeak>,
    /// Present only for `ComputeMode::TrackAndAlbum`.
    pub album: Option<GainPeak>,
}

impl GainResult {
    pub fn track(&self, path: &Path) -> Option<&GainPeak> {
        self.tracks.get(path)
    }
}

/// A gain computation engine. The scheduler only ever sees this trait.
pub trait GainComputer: Send + Sync {
    /// Name used in logs and on the command line.
    fn name(&self) -> &'static str;

    /// Compute gain for every track in the set, plus the album value when asked.
    ///
    /// The whole set is one unit: a result must cover every track.
    fn compute_gain(&self, set: &TrackSet, mode: ComputeMode) -> Result<GainResult, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Ebur128,
    Bs1770gain,
}

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("backend {name} is unavailable: {reason}")]
    Unavailable { name: &'static str, reason: String },
    #[error("no usable gain backend found ({0})")]
    NoneAvailable(String),
}

/// Options consulted while probing backends.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub bs1770gain_path: Option<PathBuf>,
}

/// Pick a backend once at startup. `Auto` tries each in preference order.
pub fn select(kind: BackendKind, opts: &BackendOptions) -> Result<Box<dyn GainComputer>, SelectError> {
    match kind {
        BackendKind::Ebur128 => Ok(Box::new(r128::Ebur128Computer::new())),
        BackendKind::Bs1770gain => bs1770gain::Bs1770gainComputer::probe(opts.bs1770gain_path.as_deref())
            .map(|c| Box::new(c) as Box<dyn GainComputer>)
            .map_err(|reason| SelectError::Unavailable { name: "bs1770gain", reason }),
        BackendKind::Auto => {
            let mut reasons = Vec::new();
            match r128::Ebur128Computer::probe() {
                Ok(c) => return Ok(Box::new(c)),
                Err(reason) => {
                    log::debug!("ebur128 backend unavailable: {}", reason);
                    reasons.push(format!("ebur128: {reason}"));
                }
            }
            match bs1770gain::Bs1770gainComputer::probe(opts.bs1770gain_path.as_deref()) {
                Ok(c) => return Ok(Box::new(c)),
                Err(reason) => {
                    log::debug!("bs1770gain backend unavailable: {}", reason);
                    reasons.push(format!("bs1770gain: {reason}"));
                }
            }
            Err(SelectError::NoneAvailable(reasons.join("; ")))
        }
    }
}

/// Convert integrated loudness to a ReplayGain value.
pub fn gain_from_loudness(lufs: f64) -> f64 {
    REFERENCE_LUFS - lufs
}
