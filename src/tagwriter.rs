use crate::backend::{GainPeak, GainResult};
use crate::grouping::TrackSet;
use lofty::aac::AacFile;
use lofty::ape::{ApeFile, ApeItem, ApeTag};
use lofty::config::{ParseOptions, WriteOptions};
use lofty::error::LoftyError;
use lofty::file::FileType;
use lofty::flac::FlacFile;
use lofty::iff::aiff::AiffFile;
use lofty::iff::wav::WavFile;
use lofty::id3::v2::Id3v2Tag;
use lofty::mp4::{Atom, AtomData, AtomIdent, Ilst, Mp4File};
use lofty::mpeg::MpegFile;
use lofty::musepack::MpcFile;
use lofty::ogg::{OpusFile, SpeexFile, VorbisComments, VorbisFile};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemValue;
use lofty::wavpack::WavPackFile;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagWriteError {
    #[error("{0} is read-only")]
    ReadOnly(PathBuf),
    #[error("unsupported file {path}: {message}")]
    Unsupported { path: PathBuf, message: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not save tags to {path}: {message}")]
    Save { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GainTag {
    TrackGain,
    TrackPeak,
    AlbumGain,
    AlbumPeak,
}

impl GainTag {
    /// Field name as written by other ReplayGain taggers.
    pub fn field_name(self) -> &'static str {
        match self {
            GainTag::TrackGain => "REPLAYGAIN_TRACK_GAIN",
            GainTag::TrackPeak => "REPLAYGAIN_TRACK_PEAK",
            GainTag::AlbumGain => "REPLAYGAIN_ALBUM_GAIN",
            GainTag::AlbumPeak => "REPLAYGAIN_ALBUM_PEAK",
        }
    }
}

pub fn format_gain(gain: f64) -> String {
    format!("{gain:.2} dB")
}

pub fn format_peak(peak: f64) -> String {
    format!("{peak:.6}")
}

/// Tag changes for one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackUpdate {
    pub path: PathBuf,
    pub set: BTreeMap<GainTag, String>,
    pub remove: Vec<GainTag>,
}

impl TrackUpdate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    fn set_pair(&mut self, gain: GainTag, peak: GainTag, value: &GainPeak) {
        self.set.insert(gain, format_gain(value.gain));
        self.set.insert(peak, format_peak(value.peak));
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Build per-file updates for a set from a computed result.
///
/// `result == None` means nothing was computed; only erasure applies.
pub fn updates_for(set: &TrackSet, result: Option<&GainResult>, erase_album: bool) -> Vec<TrackUpdate> {
    set.paths()
        .map(|path| {
            let mut update = TrackUpdate::new(path);
            if let Some(result) = result {
                if let Some(track) = result.track(path) {
                    update.set_pair(GainTag::TrackGain, GainTag::TrackPeak, track);
                }
                if let Some(album) = &result.album {
                    update.set_pair(GainTag::AlbumGain, GainTag::AlbumPeak, album);
                }
            }
            if erase_album && result.is_none_or(|r| r.album.is_none()) {
                update.remove = vec![GainTag::AlbumGain, GainTag::AlbumPeak];
            }
            update
        })
        .collect()
}

/// Persists gain tags. One call covers one whole track set.
pub trait TagWriter: Send + Sync {
    fn write(&self, updates: &[TrackUpdate]) -> Result<(), TagWriteError>;
}

/// A native tag format that can hold ReplayGain text fields.
///
/// Edits go through the format's own tag type so that items with no
/// generic equivalent (binary frames, custom atoms) survive the save.
trait GainFields {
    fn set_field(&mut self, tag: GainTag, value: &str) -> bool;
    fn remove_field(&mut self, tag: GainTag);
}

impl GainFields for VorbisComments {
    fn set_field(&mut self, tag: GainTag, value: &str) -> bool {
        self.insert(tag.field_name().to_string(), value.to_string());
        true
    }

    fn remove_field(&mut self, tag: GainTag) {
        self.remove(tag.field_name()).for_each(drop);
    }
}

impl GainFields for Id3v2Tag {
    fn set_field(&mut self, tag: GainTag, value: &str) -> bool {
        self.remove_field(tag);
        self.insert_user_text(tag.field_name().to_string(), value.to_string());
        true
    }

    fn remove_field(&mut self, tag: GainTag) {
        // TXXX descriptions are matched exactly; both spellings are in the wild.
        self.remove_user_text(tag.field_name());
        self.remove_user_text(&tag.field_name().to_lowercase());
    }
}

impl GainFields for ApeTag {
    fn set_field(&mut self, tag: GainTag, value: &str) -> bool {
        match ApeItem::new(tag.field_name().to_string(), ItemValue::Text(value.to_string())) {
            Ok(item) => {
                self.insert(item);
                true
            }
            Err(_) => false,
        }
    }

    fn remove_field(&mut self, tag: GainTag) {
        self.remove(tag.field_name());
    }
}

fn itunes_ident(tag: GainTag) -> AtomIdent<'static> {
    AtomIdent::Freeform {
        mean: Cow::Borrowed("com.apple.iTunes"),
        name: Cow::Owned(tag.field_name().to_lowercase()),
    }
}

impl GainFields for Ilst {
    fn set_field(&mut self, tag: GainTag, value: &str) -> bool {
        self.remove_field(tag);
        self.insert(Atom::new(itunes_ident(tag), AtomData::UTF8(value.to_string())));
        true
    }

    fn remove_field(&mut self, tag: GainTag) {
        self.remove(&itunes_ident(tag)).for_each(drop);
    }
}

/// Concrete lofty file types, each paired with the tag that carries gain.
trait GainTagged: AudioFile {
    /// The gain-bearing tag, created if the file has none yet.
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields>;
}

impl GainTagged for FlacFile {
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
        if self.vorbis_comments().is_none() {
            self.set_vorbis_comments(VorbisComments::default());
        }
        self.vorbis_comments_mut().map(|t| t as &mut dyn GainFields)
    }
}

impl GainTagged for VorbisFile {
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
        Some(self.vorbis_comments_mut())
    }
}

impl GainTagged for OpusFile {
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
        Some(self.vorbis_comments_mut())
    }
}

impl GainTagged for SpeexFile {
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
        Some(self.vorbis_comments_mut())
    }
}

impl GainTagged for Mp4File {
    fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
        if self.ilst().is_none() {
            self.set_ilst(Ilst::default());
        }
        self.ilst_mut().map(|t| t as &mut dyn GainFields)
    }
}

/// Files whose ReplayGain lives in an ID3v2 tag.
macro_rules! id3v2_gain_tagged {
    ($($file:ty),*) => {$(
        impl GainTagged for $file {
            fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
                if self.id3v2().is_none() {
                    self.set_id3v2(Id3v2Tag::default());
                }
                self.id3v2_mut().map(|t| t as &mut dyn GainFields)
            }
        }
    )*};
}

/// Files whose ReplayGain lives in an APEv2 tag.
macro_rules! ape_gain_tagged {
    ($($file:ty),*) => {$(
        impl GainTagged for $file {
            fn gain_fields(&mut self) -> Option<&mut dyn GainFields> {
                if self.ape().is_none() {
                    self.set_ape(ApeTag::default());
                }
                self.ape_mut().map(|t| t as &mut dyn GainFields)
            }
        }
    )*};
}

id3v2_gain_tagged!(MpegFile, WavFile, AiffFile, AacFile);
ape_gain_tagged!(ApeFile, MpcFile, WavPackFile);

/// A modified file held in memory until the whole set is ready.
trait PendingSave {
    fn save(&self, path: &Path) -> Result<(), LoftyError>;
}

impl<F: AudioFile> PendingSave for F {
    fn save(&self, path: &Path) -> Result<(), LoftyError> {
        self.save_to_path(path, WriteOptions::default())
    }
}

/// Writes through lofty into each format's native ReplayGain tag.
#[derive(Debug, Default)]
pub struct LoftyTagWriter;

impl LoftyTagWriter {
    /// Load and modify a file's tag in memory without touching the disk.
    fn prepare(update: &TrackUpdate) -> Result<Box<dyn PendingSave>, TagWriteError> {
        let path = &update.path;
        let io_err = |source| TagWriteError::Io {
            path: path.clone(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_err)?;
        if meta.permissions().readonly() {
            return Err(TagWriteError::ReadOnly(path.clone()));
        }

        let file_type = Probe::open(path)
            .and_then(|probe| Ok(probe.guess_file_type()?))
            .map_err(|e| TagWriteError::Unsupported {
                path: path.clone(),
                message: e.to_string(),
            })?
            .file_type();

        match file_type {
            Some(FileType::Flac) => Self::edit::<FlacFile>(update),
            Some(FileType::Vorbis) => Self::edit::<VorbisFile>(update),
            Some(FileType::Opus) => Self::edit::<OpusFile>(update),
            Some(FileType::Speex) => Self::edit::<SpeexFile>(update),
            Some(FileType::Mp4) => Self::edit::<Mp4File>(update),
            Some(FileType::Mpeg) => Self::edit::<MpegFile>(update),
            Some(FileType::Wav) => Self::edit::<WavFile>(update),
            Some(FileType::Aiff) => Self::edit::<AiffFile>(update),
            Some(FileType::Aac) => Self::edit::<AacFile>(update),
            Some(FileType::Ape) => Self::edit::<ApeFile>(update),
            Some(FileType::Mpc) => Self::edit::<MpcFile>(update),
            Some(FileType::WavPack) => Self::edit::<WavPackFile>(update),
            other => Err(TagWriteError::Unsupported {
                path: path.clone(),
                message: format!("cannot write ReplayGain tags to {:?}", other),
            }),
        }
    }

    fn edit<F: GainTagged + 'static>(update: &TrackUpdate) -> Result<Box<dyn PendingSave>, TagWriteError> {
        let path = &update.path;
        let unsupported = |message: String| TagWriteError::Unsupported {
            path: path.clone(),
            message,
        };

        let mut reader = File::open(path).map_err(|source| TagWriteError::Io {
            path: path.clone(),
            source,
        })?;
        let mut file = F::read_from(&mut reader, ParseOptions::new()).map_err(|e| unsupported(e.to_string()))?;
        let fields = file
            .gain_fields()
            .ok_or_else(|| unsupported("file has no writable tag".into()))?;

        for (name, value) in &update.set {
            if !fields.set_field(*name, value) {
                return Err(unsupported(format!("cannot store {}", name.field_name())));
            }
        }
        for name in &update.remove {
            fields.remove_field(*name);
        }
        Ok(Box::new(file))
    }
}

impl TagWriter for LoftyTagWriter {
    fn write(&self, updates: &[TrackUpdate]) -> Result<(), TagWriteError> {
        // Every file must be writable before any of them is touched.
        let prepared = updates
            .iter()
            .filter(|u| !u.is_empty())
            .map(|u| Self::prepare(u).map(|file| (u.path.as_path(), file)))
            .collect::<Result<Vec<(&Path, Box<dyn PendingSave>)>, _>>()?;

        for (path, file) in prepared {
            log::debug!("Saving tags to {}", path.display());
            file.save(path).map_err(|e| TagWriteError::Save {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::group;
    use crate::track::{ALBUM, TagBag, Track};

    fn set() -> TrackSet {
        let tags: TagBag = [(ALBUM, "A")].into_iter().collect();
        group(vec![
            Track::new("/m/a/01.flac", "Flac", tags.clone()),
            Track::new("/m/a/02.flac", "Flac", tags),
        ])
        .remove(0)
    }

    fn result(album: bool) -> GainResult {
        let tracks = [
            (PathBuf::from("/m/a/01.flac"), GainPeak { gain: -6.5, peak: 0.98 }),
            (PathBuf::from("/m/a/02.flac"), GainPeak { gain: 1.234, peak: 0.5 }),
        ]
        .into_iter()
        .collect();
        GainResult {
            tracks,
            album: album.then_some(GainPeak { gain: -3.0, peak: 0.98 }),
        }
    }

    #[test]
    fn formats_values() {
        assert_eq!(format_gain(-6.5), "-6.50 dB");
        assert_eq!(format_gain(1.234), "1.23 dB");
        assert_eq!(format_peak(0.5), "0.500000");
    }

    #[test]
    fn album_result_sets_all_four_tags() {
        let updates = updates_for(&set(), Some(&result(true)), false);
        assert_eq!(updates.len(), 2);
        for u in &updates {
            assert_eq!(u.set.len(), 4);
            assert_eq!(u.set[&GainTag::AlbumGain], "-3.00 dB");
            assert!(u.remove.is_empty());
        }
        assert_eq!(updates[1].set[&GainTag::TrackGain], "1.23 dB");
    }

    #[test]
    fn track_result_with_erase_removes_album_tags() {
        let updates = updates_for(&set(), Some(&result(false)), true);
        for u in &updates {
            assert_eq!(u.set.len(), 2);
            assert_eq!(u.remove, vec![GainTag::AlbumGain, GainTag::AlbumPeak]);
        }
    }

    #[test]
    fn erase_only_update() {
        let updates = updates_for(&set(), None, true);
        assert!(updates.iter().all(|u| u.set.is_empty() && u.remove.len() == 2));
        assert!(updates_for(&set(), None, false).iter().all(TrackUpdate::is_empty));
    }

    fn syncsafe(n: usize) -> [u8; 4] {
        [(n >> 21) as u8 & 0x7f, (n >> 14) as u8 & 0x7f, (n >> 7) as u8 & 0x7f, n as u8 & 0x7f]
    }

    /// An ID3v2.4 tag holding one private (binary) frame, then a few silent MPEG frames.
    fn mp3_with_private_frame(path: &Path) {
        let mut private = b"org.example.keep\0".to_vec();
        private.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut frame = b"PRIV".to_vec();
        frame.extend_from_slice(&syncsafe(private.len()));
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&private);

        let mut bytes = b"ID3\x04\x00\x00".to_vec();
        bytes.extend_from_slice(&syncsafe(frame.len()));
        bytes.extend_from_slice(&frame);
        // MPEG-1 layer III, 128 kbps, 44.1 kHz: 417 bytes per frame.
        for _ in 0..4 {
            let mut mpeg = vec![0xff, 0xfb, 0x90, 0x64];
            mpeg.resize(417, 0);
            bytes.extend_from_slice(&mpeg);
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn unrelated_frames_survive_a_gain_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01.mp3");
        mp3_with_private_frame(&path);

        let mut update = TrackUpdate::new(&path);
        update.set.insert(GainTag::TrackGain, "-1.00 dB".into());
        update.set.insert(GainTag::TrackPeak, "0.500000".into());
        LoftyTagWriter.write(&[update]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(contains(&bytes, b"org.example.keep"));
        assert!(contains(&bytes, &[0xde, 0xad, 0xbe, 0xef]));
        assert!(contains(&bytes, b"REPLAYGAIN_TRACK_GAIN"));
        assert!(contains(&bytes, b"-1.00 dB"));

        // A second pass that only removes leaves the private frame too.
        let mut erase = TrackUpdate::new(&path);
        erase.remove = vec![GainTag::TrackGain, GainTag::TrackPeak];
        LoftyTagWriter.write(&[erase]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(contains(&bytes, b"org.example.keep"));
        assert!(!contains(&bytes, b"REPLAYGAIN_TRACK_GAIN"));
    }

    #[test]
    fn unreadable_file_fails_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.flac");
        std::fs::write(&good, b"not audio").unwrap();
        let mut update = TrackUpdate::new(&good);
        update.set.insert(GainTag::TrackGain, "-1.00 dB".into());
        let missing = TrackUpdate {
            path: dir.path().join("missing.flac"),
            ..update.clone()
        };

        let err = LoftyTagWriter.write(&[update, missing]).unwrap_err();
        assert!(matches!(err, TagWriteError::Unsupported { .. }));
        assert_eq!(std::fs::read(&good).unwrap(), b"not audio");
    }
}
