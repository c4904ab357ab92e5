use crate::track::*;
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use std::path::Path;

use super::ScanError;

/// Text items copied into the tag bag, by bag name.
const TEXT_ITEMS: &[(&str, ItemKey)] = &[
    (ALBUM, ItemKey::AlbumTitle),
    (ALBUM_SORT, ItemKey::AlbumTitleSortOrder),
    (ALBUM_ARTIST, ItemKey::AlbumArtist),
    (ALBUM_ARTIST_SORT, ItemKey::AlbumArtistSortOrder),
    (ARTIST, ItemKey::TrackArtist),
    (ARTIST_SORT, ItemKey::TrackArtistSortOrder),
    (TRACK_GAIN, ItemKey::ReplayGainTrackGain),
    (TRACK_PEAK, ItemKey::ReplayGainTrackPeak),
    (ALBUM_GAIN, ItemKey::ReplayGainAlbumGain),
    (ALBUM_PEAK, ItemKey::ReplayGainAlbumPeak),
];

/// Read a file's format and tag snapshot.
///
/// A readable file without any tag yields an empty bag; an unreadable one is an error.
pub fn read_track(path: &Path) -> Result<Track, ScanError> {
    let tagged_file = lofty::read_from_path(path).map_err(|e| ScanError::Metadata {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let format = format!("{:?}", tagged_file.file_type());
    let mut tags = TagBag::new();

    // Try primary tag, then fall back
    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        for (name, key) in TEXT_ITEMS {
            if let Some(value) = tag.get_string(key) {
                tags.insert(name, value);
            }
        }
        if let Some(disc) = tag.disk() {
            tags.insert(DISC_NUMBER, disc.to_string());
        }
    } else {
        log::debug!("No tags in {}", path.display());
    }

    Ok(Track::new(path, format, tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        std::fs::write(&path, b"\0\0\0\0 nothing here").unwrap();
        assert!(matches!(read_track(&path), Err(ScanError::Metadata { .. })));
    }
}
