use crate::track::Track;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Equivalence key for album grouping.
///
/// Field order is the sort order of the resulting sets, so output is
/// grouped by directory first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackSetKey {
    pub directory: PathBuf,
    pub format: String,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub disc: Option<String>,
    /// Set only for tracks without an album tag, which never share a set.
    pub orphan: Option<PathBuf>,
}

impl TrackSetKey {
    pub fn for_track(track: &Track) -> Self {
        let album = track.album().map(str::to_string);
        let orphan = album.is_none().then(|| track.path.clone());
        Self {
            directory: track.directory().to_path_buf(),
            format: track.format.clone(),
            album,
            album_artist: track.album_artist().map(str::to_string),
            disc: track.disc_number().map(str::to_string),
            orphan,
        }
    }
}

impl fmt::Display for TrackSetKey {
    /// Human-readable description; not guaranteed unique.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.album, &self.orphan) {
            (Some(album), _) => write!(f, "{album}")?,
            (None, Some(path)) => write!(
                f,
                "[No album: {}]",
                path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            )?,
            (None, None) => write!(f, "[No album]")?,
        }
        if let Some(disc) = &self.disc {
            write!(f, " Disc {disc}")?;
        }
        if let Some(artist) = &self.album_artist {
            write!(f, " by {artist}")?;
        }
        write!(
            f,
            " in directory {} of type {}",
            self.directory.display(),
            self.format
        )
    }
}

/// Tracks sharing one key, ordered by path. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSet {
    key: TrackSetKey,
    tracks: Vec<Track>,
}

impl TrackSet {
    fn new(key: TrackSetKey, mut tracks: Vec<Track>) -> Self {
        debug_assert!(!tracks.is_empty());
        tracks.sort_by(|a, b| a.path.cmp(&b.path));
        Self { key, tracks }
    }

    pub fn key(&self) -> &TrackSetKey {
        &self.key
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn directory(&self) -> &Path {
        &self.key.directory
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.tracks.iter().map(|t| t.path.as_path())
    }
}

impl fmt::Display for TrackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

/// Partition tracks into track sets, sorted by key.
///
/// A track listed twice (same path) is kept once.
pub fn group<I>(tracks: I) -> Vec<TrackSet>
where
    I: IntoIterator<Item = Track>,
{
    let mut buckets: BTreeMap<TrackSetKey, BTreeMap<PathBuf, Track>> = BTreeMap::new();
    for track in tracks {
        let key = TrackSetKey::for_track(&track);
        buckets
            .entry(key)
            .or_default()
            .entry(track.path.clone())
            .or_insert(track);
    }

    buckets
        .into_iter()
        .map(|(key, members)| TrackSet::new(key, members.into_values().collect()))
        .collect()
}
