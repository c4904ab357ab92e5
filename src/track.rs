use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ALBUM: &str = "album";
pub const ALBUM_SORT: &str = "albumsort";
pub const ALBUM_ARTIST: &str = "albumartist";
pub const ALBUM_ARTIST_SORT: &str = "albumartistsort";
pub const ARTIST: &str = "artist";
pub const ARTIST_SORT: &str = "artistsort";
pub const DISC_NUMBER: &str = "discnumber";
pub const TRACK_GAIN: &str = "replaygain_track_gain";
pub const TRACK_PEAK: &str = "replaygain_track_peak";
pub const ALBUM_GAIN: &str = "replaygain_album_gain";
pub const ALBUM_PEAK: &str = "replaygain_album_peak";

/// Album identifier lookup order: sort tag first.
const ALBUM_CHAIN: &[&str] = &[ALBUM_SORT, ALBUM];

/// Album-artist lookup order. Track artist tags only count when
/// neither album-artist tag is present.
const ALBUM_ARTIST_CHAIN: &[&str] = &[ALBUM_ARTIST_SORT, ALBUM_ARTIST, ARTIST_SORT, ARTIST];

/// Tag name → value, as read from the file at scan time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagBag(BTreeMap<String, String>);

impl TagBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag. Blank values are dropped so "present" always means non-empty.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        self.0.insert(name.to_lowercase(), trimmed.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// First present tag from `names`.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|n| self.get(n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for TagBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = TagBag::new();
        for (k, v) in iter {
            bag.insert(k.as_ref(), v);
        }
        bag
    }
}

/// One audio file and the tag snapshot taken when it was scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub path: PathBuf,
    /// Container/codec identifier (e.g. "Flac", "Mpeg").
    pub format: String,
    pub tags: TagBag,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>, format: impl Into<String>, tags: TagBag) -> Self {
        Self {
            path: path.into(),
            format: format.into(),
            tags,
        }
    }

    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn album(&self) -> Option<&str> {
        self.tags.first_of(ALBUM_CHAIN)
    }

    pub fn album_artist(&self) -> Option<&str> {
        self.tags.first_of(ALBUM_ARTIST_CHAIN)
    }

    pub fn disc_number(&self) -> Option<&str> {
        self.tags.get(DISC_NUMBER)
    }

    pub fn has_album_gain_tags(&self) -> bool {
        self.tags.contains(ALBUM_GAIN) || self.tags.contains(ALBUM_PEAK)
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("?")
    }
}
