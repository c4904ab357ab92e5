use super::{BackendError, ComputeMode, GainComputer, GainPeak, GainResult};
use crate::grouping::TrackSet;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

const TOOL: &str = "bs1770gain";

/// Environment variable that overrides the executable location.
pub const PATH_ENV: &str = "BS1770GAIN_PATH";

/// Backend that shells out to the `bs1770gain` executable and reads its XML report.
pub struct Bs1770gainComputer {
    executable: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    album: Vec<AlbumReport>,
}

#[derive(Debug, Deserialize)]
struct AlbumReport {
    #[serde(default)]
    track: Vec<TrackReport>,
    summary: Measurement,
}

#[derive(Debug, Deserialize)]
struct TrackReport {
    #[serde(rename = "@file")]
    file: String,
    integrated: Integrated,
    #[serde(rename = "sample-peak")]
    sample_peak: SamplePeak,
}

impl TrackReport {
    fn gain_peak(&self) -> GainPeak {
        GainPeak {
            gain: self.integrated.lu,
            peak: self.sample_peak.factor,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Measurement {
    integrated: Integrated,
    #[serde(rename = "sample-peak")]
    sample_peak: SamplePeak,
}

#[derive(Debug, Deserialize)]
struct Integrated {
    /// Gain relative to the ReplayGain reference, in LU (== dB).
    #[serde(rename = "@lu")]
    lu: f64,
}

#[derive(Debug, Deserialize)]
struct SamplePeak {
    #[serde(rename = "@factor")]
    factor: f64,
}

impl Measurement {
    fn gain_peak(&self) -> GainPeak {
        GainPeak {
            gain: self.integrated.lu,
            peak: self.sample_peak.factor,
        }
    }
}

impl Bs1770gainComputer {
    /// Locate the executable: explicit path, then `$BS1770GAIN_PATH`, then `$PATH`.
    pub fn probe(explicit: Option<&Path>) -> Result<Self, String> {
        let executable = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(TOOL));

        match Command::new(&executable).arg("--help").output() {
            Ok(_) => {
                log::debug!("Using {} at {}", TOOL, executable.display());
                Ok(Self { executable })
            }
            Err(e) => Err(format!(
                "could not run {}: {}. Install {} or set {}",
                executable.display(),
                e,
                TOOL,
                PATH_ENV
            )),
        }
    }

    fn tool_error(message: impl Into<String>) -> BackendError {
        BackendError::Tool {
            tool: TOOL.to_string(),
            message: message.into(),
        }
    }
}

/// Map each file name in the report back to the set's full paths.
fn parse_report(
    xml: &str,
    set: &TrackSet,
    mode: ComputeMode,
) -> Result<GainResult, BackendError> {
    let report_err = |message: String| BackendError::Report {
        tool: TOOL.to_string(),
        message,
    };

    let by_name: HashMap<&str, &Path> = set
        .tracks()
        .iter()
        .map(|t| (t.file_name(), t.path.as_path()))
        .collect();

    let report: Report = quick_xml::de::from_str(xml).map_err(|e| report_err(e.to_string()))?;
    let album = report
        .album
        .first()
        .ok_or_else(|| report_err("report has no <album> element".into()))?;

    let mut tracks = BTreeMap::new();
    for entry in report.album.iter().flat_map(|a| a.track.iter()) {
        let path = by_name
            .get(entry.file.as_str())
            .ok_or_else(|| report_err(format!("unexpected file {} in report", entry.file)))?;
        tracks.insert(path.to_path_buf(), entry.gain_peak());
    }

    if let Some(missing) = set.paths().find(|p| !tracks.contains_key(*p)) {
        return Err(report_err(format!("no result for {}", missing.display())));
    }

    let album = match mode {
        ComputeMode::TrackOnly => None,
        ComputeMode::TrackAndAlbum => Some(album.summary.gain_peak()),
    };
    Ok(GainResult { tracks, album })
}

impl GainComputer for Bs1770gainComputer {
    fn name(&self) -> &'static str {
        TOOL
    }

    fn compute_gain(&self, set: &TrackSet, mode: ComputeMode) -> Result<GainResult, BackendError> {
        // The report only names files by basename.
        let mut seen = HashMap::new();
        for track in set.tracks() {
            if let Some(other) = seen.insert(track.file_name(), &track.path) {
                return Err(BackendError::Unsupported {
                    path: track.path.clone(),
                    message: format!("{} cannot handle two files named like {}", TOOL, other.display()),
                });
            }
        }

        let output = Command::new(&self.executable)
            .args(["--replaygain", "--integrated", "--samplepeak", "--xml"])
            .args(set.paths())
            .output()
            .map_err(|e| Self::tool_error(format!("could not start {}: {}", self.executable.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::tool_error(format!("{} ({})", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_report(&stdout, set, mode)
    }
}
