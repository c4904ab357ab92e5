pub mod metadata;

use crate::context::RunContext;
use crate::track::Track;
use indicatif::ProgressBar;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Metadata error for {path}: {message}")]
    Metadata { path: String, message: String },
    #[error("no valid music directories or files given")]
    NoRoots,
    #[error("Failed to find any tracks in the directories you specified")]
    NoTracks,
}

impl ScanError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ScanError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_hidden: bool,
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            extensions: crate::SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ScanOptions {
    fn is_audio_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Canonicalize roots, dropping (with a warning) any that don't exist.
pub fn resolve_roots(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ScanError> {
    let mut roots = Vec::new();
    for p in paths {
        match std::fs::canonicalize(p) {
            Ok(root) => {
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
            Err(e) => log::warn!("Skipping {}: {}", p.display(), e),
        }
    }
    if roots.is_empty() {
        return Err(ScanError::NoRoots);
    }
    Ok(roots)
}

/// Tracks found directly inside one directory.
#[derive(Debug)]
pub struct DirectoryBatch {
    pub directory: PathBuf,
    pub tracks: Vec<Track>,
    pub errors: Vec<ScanError>,
}

/// Running totals over the batches of one scan.
#[derive(Debug, Default)]
pub struct ScanCounts {
    tracks: AtomicUsize,
    errors: AtomicUsize,
}

impl ScanCounts {
    pub fn record(&self, batch: &DirectoryBatch) {
        self.tracks.fetch_add(batch.tracks.len(), Ordering::Relaxed);
        self.errors.fetch_add(batch.errors.len(), Ordering::Relaxed);
    }

    pub fn tracks(&self) -> usize {
        self.tracks.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// An empty library is a fatal error in both scan modes.
    pub fn ensure_tracks(&self) -> Result<(), ScanError> {
        if self.tracks() == 0 {
            return Err(ScanError::NoTracks);
        }
        Ok(())
    }
}

/// True when walking `root` reaches `path` (or `path` is `root` itself).
fn covers(root: &Path, path: &Path, include_hidden: bool) -> bool {
    match path.strip_prefix(root) {
        Ok(rest) => include_hidden || !rest.components().any(|c| is_hidden(Path::new(c.as_os_str()))),
        Err(_) => false,
    }
}

type EntryIter = Box<dyn Iterator<Item = walkdir::Result<walkdir::DirEntry>> + Send>;

/// Walks roots one directory at a time, yielding that directory's tracks.
///
/// Directories come out in sorted depth-first order. Roots nested inside
/// another root are dropped up front, and symlinked directories are only
/// followed when their target lies outside every root, so each directory is
/// visited once without remembering the paths already seen. Roots that are
/// plain files are held back until every directory root has been walked.
pub struct DirectoryBatches {
    opts: ScanOptions,
    dir_roots: Arc<Vec<PathBuf>>,
    pending: VecDeque<PathBuf>,
    file_roots: BTreeMap<PathBuf, Vec<PathBuf>>,
    walker: Option<EntryIter>,
    /// Targets of symlinks leading out of every root.
    link_targets: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DirectoryBatches {
    /// `roots` should come from [`resolve_roots`].
    pub fn new(roots: Vec<PathBuf>, opts: ScanOptions) -> Self {
        let include_hidden = opts.include_hidden;
        let (dirs, files): (Vec<PathBuf>, Vec<PathBuf>) = roots.into_iter().partition(|r| r.is_dir());

        let pending = dirs
            .iter()
            .filter(|d| !dirs.iter().any(|r| r != *d && covers(r, d, include_hidden)))
            .cloned()
            .collect();

        let mut file_roots: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for file in files {
            let walked = opts.is_audio_file(&file) && dirs.iter().any(|r| covers(r, &file, include_hidden));
            if walked {
                continue;
            }
            let parent = file.parent().map(Path::to_path_buf).unwrap_or_default();
            file_roots.entry(parent).or_default().push(file);
        }

        Self {
            opts,
            dir_roots: Arc::new(dirs),
            pending,
            file_roots,
            walker: None,
            link_targets: Arc::default(),
        }
    }

    fn walk(&self, root: &Path) -> EntryIter {
        let include_hidden = self.opts.include_hidden;
        let roots = Arc::clone(&self.dir_roots);
        let link_targets = Arc::clone(&self.link_targets);
        Box::new(
            WalkDir::new(root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(move |e| {
                    if e.depth() == 0 {
                        return true;
                    }
                    if !include_hidden && is_hidden(e.path()) {
                        return false;
                    }
                    if !e.path_is_symlink() || !e.file_type().is_dir() {
                        return true;
                    }
                    let target = match std::fs::canonicalize(e.path()) {
                        Ok(target) => target,
                        Err(err) => {
                            log::warn!("Skipping {}: {}", e.path().display(), err);
                            return false;
                        }
                    };
                    if roots.iter().any(|r| covers(r, &target, include_hidden)) {
                        log::debug!("Not following {}: target is walked directly", e.path().display());
                        return false;
                    }
                    link_targets
                        .lock()
                        .map(|mut seen| seen.insert(target))
                        .unwrap_or(false)
                }),
        )
    }

    /// Audio files directly inside `dir`, sorted by name.
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| ScanError::io(dir, e))? {
            let path = entry.map_err(|e| ScanError::io(dir, e))?.path();
            if !self.opts.include_hidden && is_hidden(&path) {
                continue;
            }
            if path.is_file() && self.opts.is_audio_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read every listed file into a batch.
    fn read_batch(directory: PathBuf, files: Vec<PathBuf>) -> DirectoryBatch {
        let mut tracks = Vec::new();
        let mut errors = Vec::new();
        for path in files {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() == 0 => {
                    log::debug!("File {} has zero size", path.display());
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    errors.push(ScanError::io(&path, e));
                    continue;
                }
            }
            match metadata::read_track(&path) {
                Ok(track) => tracks.push(track),
                Err(e) => errors.push(e),
            }
        }
        for e in &errors {
            log::warn!("Error scanning: {}", e);
        }
        DirectoryBatch {
            directory,
            tracks,
            errors,
        }
    }

    fn next_file_root_batch(&mut self) -> Option<DirectoryBatch> {
        while let Some((directory, files)) = self.file_roots.pop_first() {
            let batch = Self::read_batch(directory, files);
            if !batch.tracks.is_empty() || !batch.errors.is_empty() {
                return Some(batch);
            }
        }
        None
    }
}

impl Iterator for DirectoryBatches {
    type Item = DirectoryBatch;

    fn next(&mut self) -> Option<DirectoryBatch> {
        loop {
            let walker = match self.walker.as_mut() {
                Some(walker) => walker,
                None => match self.pending.pop_front() {
                    Some(root) => {
                        log::debug!("Searching for music files in {}", root.display());
                        self.walker = Some(self.walk(&root));
                        continue;
                    }
                    None => return self.next_file_root_batch(),
                },
            };

            let entry = match walker.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    log::warn!("Error walking directory: {}", e);
                    continue;
                }
                None => {
                    self.walker = None;
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            // Directories under a followed symlink are reported by their real path.
            let directory = match std::fs::canonicalize(entry.path()) {
                Ok(dir) => dir,
                Err(e) => {
                    log::warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            let batch = match self.list_dir(&directory) {
                Ok(files) => Self::read_batch(directory, files),
                Err(e) => {
                    log::warn!("Error scanning: {}", e);
                    DirectoryBatch {
                        directory,
                        tracks: Vec::new(),
                        errors: vec![e],
                    }
                }
            };
            if !batch.tracks.is_empty() || !batch.errors.is_empty() {
                return Some(batch);
            }
        }
    }
}

pub struct ScanResult {
    pub tracks: Vec<Track>,
    pub errors: Vec<ScanError>,
    /// The scan stopped early because the run was cancelled.
    pub interrupted: bool,
}

/// Scan every root up front, stopping early if the run is cancelled.
pub fn scan(roots: Vec<PathBuf>, opts: ScanOptions, ctx: &RunContext) -> ScanResult {
    let pb = if ctx.progress().is_hidden() {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    pb.set_message("Scanning...");
    let mut result = ScanResult {
        tracks: Vec::new(),
        errors: Vec::new(),
        interrupted: false,
    };
    let mut batches = DirectoryBatches::new(roots, opts);
    loop {
        if ctx.is_cancelled() {
            result.interrupted = true;
            break;
        }
        let Some(batch) = batches.next() else {
            break;
        };
        pb.inc(batch.tracks.len() as u64);
        result.tracks.extend(batch.tracks);
        result.errors.extend(batch.errors);
    }
    pb.finish_with_message(format!(
        "Found {} tracks, {} errors",
        result.tracks.len(),
        result.errors.len()
    ));
    result
}
