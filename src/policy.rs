use crate::grouping::TrackSet;
use crate::track::{ALBUM_GAIN, ALBUM_PEAK, TRACK_GAIN, TRACK_PEAK, Track};
use clap::ValueEnum;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

/// Files whose presence in a directory switches `auto` to track gain.
pub const TRACK_GAIN_MARKERS: &[&str] = &["trackgain", ".trackgain", "_trackgain"];

/// Album gain/peak values within this distance count as the same album value.
const CONSISTENCY_TOLERANCE: f64 = 0.01;

static GAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([+-]?(?:\d+\.?\d*|\.\d+)(?:e[+-]?\d+)?)\s*(?:db)?\s*$").unwrap()
});

/// Configured gain type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GainMode {
    Track,
    Album,
    #[default]
    Auto,
}

/// Gain type after `auto` has been resolved for one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Track,
    Album,
}

impl GainMode {
    /// Resolve against the set's directory. Only `auto` touches the filesystem.
    pub fn resolve(self, directory: &Path) -> ResolvedMode {
        match self {
            GainMode::Track => ResolvedMode::Track,
            GainMode::Album => ResolvedMode::Album,
            GainMode::Auto => {
                if has_track_gain_marker(directory) {
                    ResolvedMode::Track
                } else {
                    ResolvedMode::Album
                }
            }
        }
    }
}

/// Case-insensitive search for a marker file directly inside `directory`.
pub fn has_track_gain_marker(directory: &Path) -> bool {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Could not list {}: {}", directory.display(), e);
            return false;
        }
    };
    entries.filter_map(Result::ok).any(|entry| {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        TRACK_GAIN_MARKERS.contains(&name.as_str())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip,
    TrackOnly,
    TrackAndAlbum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// Existing album gain/peak tags must be removed.
    pub erase_album: bool,
}

impl Decision {
    pub fn needs_backend(&self) -> bool {
        self.action != Action::Skip
    }

    pub fn needs_write(&self) -> bool {
        self.needs_backend() || self.erase_album
    }
}

/// Parse a gain value such as `-6.54 dB`. `None` for anything non-finite.
pub fn parse_gain(value: &str) -> Option<f64> {
    let caps = GAIN_RE.captures(value)?;
    caps[1].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a peak value (plain linear amplitude).
pub fn parse_peak(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn has_valid_track_gain(track: &Track) -> bool {
    track.tags.get(TRACK_GAIN).and_then(parse_gain).is_some()
        && track.tags.get(TRACK_PEAK).and_then(parse_peak).is_some()
}

fn all_close(values: &[f64]) -> bool {
    match values.split_first() {
        Some((first, rest)) => rest.iter().all(|v| (v - first).abs() <= CONSISTENCY_TOLERANCE),
        None => false,
    }
}

/// Every track has parseable album gain/peak and they agree across the set.
fn has_consistent_album_gain(set: &TrackSet) -> bool {
    let gains: Option<Vec<f64>> = set
        .tracks()
        .iter()
        .map(|t| t.tags.get(ALBUM_GAIN).and_then(parse_gain))
        .collect();
    let peaks: Option<Vec<f64>> = set
        .tracks()
        .iter()
        .map(|t| t.tags.get(ALBUM_PEAK).and_then(parse_peak))
        .collect();
    match (gains, peaks) {
        (Some(gains), Some(peaks)) => all_close(&gains) && all_close(&peaks),
        _ => false,
    }
}

/// Classify a set: skip, or which gain values must be (re)computed.
pub fn decide(set: &TrackSet, mode: ResolvedMode, force: bool) -> Decision {
    match mode {
        ResolvedMode::Track => {
            let erase_album = set.tracks().iter().any(Track::has_album_gain_tags);
            let up_to_date = !force && set.tracks().iter().all(has_valid_track_gain);
            Decision {
                action: if up_to_date { Action::Skip } else { Action::TrackOnly },
                erase_album,
            }
        }
        ResolvedMode::Album => {
            let up_to_date = !force
                && set.tracks().iter().all(has_valid_track_gain)
                && has_consistent_album_gain(set);
            Decision {
                action: if up_to_date { Action::Skip } else { Action::TrackAndAlbum },
                erase_album: false,
            }
        }
    }
}
