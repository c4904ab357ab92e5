use crate::backend::{BackendError, ComputeMode, GainComputer, GainResult};
use crate::context::RunContext;
use crate::grouping::{TrackSet, TrackSetKey, group};
use crate::policy::{Action, Decision, GainMode, ResolvedMode, decide};
use crate::scanner::{DirectoryBatch, ScanCounts};
use crate::tagwriter::{TagWriteError, TagWriter, format_gain, format_peak, updates_for};
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

/// A track set with its gain mode and recompute decision settled.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub set: TrackSet,
    pub mode: ResolvedMode,
    pub decision: Decision,
}

impl WorkItem {
    /// Resolve the gain mode for the set's directory and classify it.
    pub fn plan(set: TrackSet, gain_mode: GainMode, force: bool) -> Self {
        let mode = gain_mode.resolve(set.directory());
        let decision = decide(&set, mode, force);
        Self { set, mode, decision }
    }
}

/// Where work items come from.
pub enum WorkSource {
    /// Everything materialized up front; allows a progress total.
    Eager(Vec<WorkItem>),
    /// Produced on demand, consumed once.
    Lazy(Box<dyn Iterator<Item = WorkItem> + Send>),
}

impl WorkSource {
    pub fn eager(sets: Vec<TrackSet>, gain_mode: GainMode, force: bool) -> Self {
        WorkSource::Eager(
            sets.into_iter()
                .map(|set| WorkItem::plan(set, gain_mode, force))
                .collect(),
        )
    }

    /// Group and plan each directory as the walker reaches it.
    ///
    /// `counts` tallies tracks and unreadable files along the way.
    pub fn lazy<I>(batches: I, gain_mode: GainMode, force: bool, counts: Arc<ScanCounts>) -> Self
    where
        I: Iterator<Item = DirectoryBatch> + Send + 'static,
    {
        let items = batches.flat_map(move |batch| {
            counts.record(&batch);
            group(batch.tracks)
                .into_iter()
                .map(move |set| WorkItem::plan(set, gain_mode, force))
        });
        WorkSource::Lazy(Box::new(items))
    }

    /// Total track count, when known in advance.
    pub fn total_tracks(&self) -> Option<u64> {
        match self {
            WorkSource::Eager(items) => Some(items.iter().map(|i| i.set.len() as u64).sum()),
            WorkSource::Lazy(_) => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkError {
    #[error("failed to analyze {set}: {source}")]
    Backend {
        set: String,
        #[source]
        source: BackendError,
    },
    #[error("failed to write tags for {set}: {source}")]
    Write {
        set: String,
        #[source]
        source: TagWriteError,
    },
}

#[derive(Debug)]
pub enum Outcome {
    /// Tags already valid; nothing done.
    Skipped,
    /// Gain computed (if needed) and tags written, or only reported on a dry run.
    Updated {
        result: Option<GainResult>,
        written: bool,
    },
    Failed(WorkError),
    /// Never started, or stopped before writing, because the run was interrupted.
    Cancelled,
}

#[derive(Debug)]
pub struct ItemReport {
    pub key: TrackSetKey,
    pub tracks: usize,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub analyzed: usize,
    pub skipped: usize,
    /// Sets that only had stale album tags removed.
    pub erased: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub interrupted: bool,
    /// Sorted by set key. Lazy runs keep only the failed items.
    pub items: Vec<ItemReport>,
}

impl RunReport {
    /// Count one outcome, keeping the item itself only when asked or failed.
    fn record(mut self, item: ItemReport, keep_all: bool) -> Self {
        match &item.outcome {
            Outcome::Skipped => self.skipped += 1,
            Outcome::Updated { result: Some(_), .. } => self.analyzed += 1,
            Outcome::Updated { result: None, .. } => self.erased += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
        if keep_all || matches!(item.outcome, Outcome::Failed(_)) {
            self.items.push(item);
        }
        self
    }

    fn merge(mut self, other: Self) -> Self {
        self.analyzed += other.analyzed;
        self.skipped += other.skipped;
        self.erased += other.erased;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.items.extend(other.items);
        self
    }

    fn finish(mut self, interrupted: bool) -> Self {
        self.items.sort_by(|a, b| a.key.cmp(&b.key));
        self.interrupted = interrupted;
        self
    }

    /// True when every item completed and the run was not interrupted.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && !self.interrupted
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkError> {
        self.items.iter().filter_map(|i| match &i.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        })
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("could not start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Runs work items on a fixed-size pool. Each worker takes one set from
/// compute through tag write before picking up another.
pub struct Scheduler<'a> {
    backend: &'a dyn GainComputer,
    writer: &'a dyn TagWriter,
    jobs: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(backend: &'a dyn GainComputer, writer: &'a dyn TagWriter, jobs: usize) -> Self {
        Self {
            backend,
            writer,
            jobs: jobs.max(1),
        }
    }

    pub fn run(&self, source: WorkSource, ctx: &RunContext) -> Result<RunReport, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()?;

        match source.total_tracks() {
            Some(total) => ctx.start_bar(total),
            None => ctx.start_spinner(),
        }
        log::info!("Beginning analysis with {} workers using {}", self.jobs, self.backend.name());

        let report = pool
            .install(|| match source {
                WorkSource::Eager(items) => items
                    .into_par_iter()
                    .map(|item| self.process(item, ctx))
                    .fold(RunReport::default, |report, item| report.record(item, true))
                    .reduce(RunReport::default, RunReport::merge),
                // Stop pulling new sets (and scanning) as soon as we're interrupted.
                WorkSource::Lazy(items) => items
                    .take_while(|_| !ctx.is_cancelled())
                    .par_bridge()
                    .map(|item| self.process(item, ctx))
                    .fold(RunReport::default, |report, item| report.record(item, false))
                    .reduce(RunReport::default, RunReport::merge),
            })
            .finish(ctx.is_cancelled());
        ctx.progress().finish_with_message(format!(
            "Done: {} analyzed, {} skipped, {} failed",
            report.analyzed, report.skipped, report.failed
        ));
        Ok(report)
    }

    fn process(&self, item: WorkItem, ctx: &RunContext) -> ItemReport {
        let tracks = item.set.len();
        let outcome = if ctx.is_cancelled() {
            Outcome::Cancelled
        } else {
            self.handle(&item, ctx)
        };
        if let Outcome::Failed(e) = &outcome {
            log::error!("{}. Skipping this track set.", e);
        }
        ctx.progress().inc(tracks as u64);
        ItemReport {
            key: item.set.key().clone(),
            tracks,
            outcome,
        }
    }

    /// Compute then write, strictly in that order, for one set.
    fn handle(&self, item: &WorkItem, ctx: &RunContext) -> Outcome {
        let set = &item.set;
        let decision = item.decision;

        if !decision.needs_write() {
            log::info!("Skipping previously-analyzed track set {}", set);
            return Outcome::Skipped;
        }

        let result = match decision.action {
            Action::Skip => {
                log::info!("Removing stale album gain tags from {}", set);
                None
            }
            Action::TrackOnly | Action::TrackAndAlbum => {
                let mode = if decision.action == Action::TrackAndAlbum {
                    ComputeMode::TrackAndAlbum
                } else {
                    ComputeMode::TrackOnly
                };
                log::info!("Analyzing track set {}", set);
                match self.backend.compute_gain(set, mode) {
                    Ok(result) => Some(result),
                    Err(source) => {
                        return Outcome::Failed(WorkError::Backend {
                            set: set.to_string(),
                            source,
                        });
                    }
                }
            }
        };

        if let Some(result) = &result {
            report_values(set, result);
        }

        if ctx.dry_run {
            return Outcome::Updated {
                result,
                written: false,
            };
        }

        let updates = updates_for(set, result.as_ref(), decision.erase_album);
        let Some(_writing) = ctx.begin_write() else {
            log::warn!("Not writing tags for {}: aborted", set);
            return Outcome::Cancelled;
        };
        match self.writer.write(&updates) {
            Ok(()) => Outcome::Updated {
                result,
                written: true,
            },
            Err(source) => Outcome::Failed(WorkError::Write {
                set: set.to_string(),
                source,
            }),
        }
    }
}

fn report_values(set: &TrackSet, result: &GainResult) {
    for track in set.tracks() {
        if let Some(v) = result.track(&track.path) {
            log::info!(
                "Track gain for {}: {} (peak {})",
                track.path.display(),
                format_gain(v.gain),
                format_peak(v.peak)
            );
        }
    }
    match &result.album {
        Some(v) => log::info!(
            "Album gain for {}: {} (peak {})",
            set,
            format_gain(v.gain),
            format_peak(v.peak)
        ),
        None => log::debug!("No album gain for {}", set),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GainPeak;
    use crate::tagwriter::{GainTag, TrackUpdate};
    use crate::track::*;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed values derived from the path; fails for one album.
    struct FakeBackend {
        calls: AtomicUsize,
        fail_album: Option<&'static str>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_album: None,
            }
        }

        fn failing(album: &'static str) -> Self {
            Self {
                fail_album: Some(album),
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GainComputer for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn compute_gain(&self, set: &TrackSet, mode: ComputeMode) -> Result<GainResult, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if set.key().album.as_deref() == self.fail_album {
                return Err(BackendError::Tool {
                    tool: "fake".into(),
                    message: "exit status 1".into(),
                });
            }
            let tracks = set
                .paths()
                .map(|p| {
                    let gain = -(p.as_os_str().len() as f64) / 10.0;
                    (p.to_path_buf(), GainPeak { gain, peak: 0.5 })
                })
                .collect();
            let album = (mode == ComputeMode::TrackAndAlbum).then_some(GainPeak { gain: -7.0, peak: 0.9 });
            Ok(GainResult { tracks, album })
        }
    }

    /// Applies updates to an in-memory tag store keyed by path.
    #[derive(Default)]
    struct MemoryWriter {
        files: Mutex<BTreeMap<PathBuf, TagBag>>,
        writes: AtomicUsize,
        /// Files under this directory refuse every write.
        read_only_dir: Option<&'static str>,
    }

    impl MemoryWriter {
        fn read_only(dir: &'static str) -> Self {
            Self {
                read_only_dir: Some(dir),
                ..Self::default()
            }
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn snapshot(&self) -> BTreeMap<PathBuf, TagBag> {
            self.files.lock().unwrap().clone()
        }

        /// Re-read the stored tags as tracks, like a second scan would.
        fn rescan(&self, originals: &[Track]) -> Vec<Track> {
            let files = self.files.lock().unwrap();
            originals
                .iter()
                .map(|t| {
                    let mut track = t.clone();
                    if let Some(bag) = files.get(&t.path) {
                        track.tags = bag.clone();
                    }
                    track
                })
                .collect()
        }
    }

    fn tag_name(tag: GainTag) -> &'static str {
        match tag {
            GainTag::TrackGain => TRACK_GAIN,
            GainTag::TrackPeak => TRACK_PEAK,
            GainTag::AlbumGain => ALBUM_GAIN,
            GainTag::AlbumPeak => ALBUM_PEAK,
        }
    }

    impl TagWriter for MemoryWriter {
        fn write(&self, updates: &[TrackUpdate]) -> Result<(), TagWriteError> {
            if let Some(dir) = self.read_only_dir {
                if let Some(u) = updates.iter().find(|u| u.path.starts_with(dir)) {
                    return Err(TagWriteError::ReadOnly(u.path.clone()));
                }
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut files = self.files.lock().unwrap();
            for u in updates {
                let bag = files.entry(u.path.clone()).or_default();
                let mut kept: Vec<(String, String)> = Vec::new();
                for name in [ALBUM, ALBUM_ARTIST, TRACK_GAIN, TRACK_PEAK, ALBUM_GAIN, ALBUM_PEAK] {
                    let removed = u.remove.iter().any(|r| tag_name(*r) == name);
                    if let (false, Some(v)) = (removed, bag.get(name)) {
                        kept.push((name.to_string(), v.to_string()));
                    }
                }
                for (tag, value) in &u.set {
                    kept.retain(|(k, _)| k != tag_name(*tag));
                    kept.push((tag_name(*tag).to_string(), value.clone()));
                }
                *bag = kept.into_iter().collect();
            }
            Ok(())
        }
    }

    fn track(path: &str, album: &str) -> Track {
        let tags: TagBag = [(ALBUM, album), (ALBUM_ARTIST, "Artist")].into_iter().collect();
        Track::new(path, "Flac", tags)
    }

    /// Three albums in directories that don't exist, so `auto` resolves to album mode.
    fn library() -> Vec<Track> {
        vec![
            track("/nonexistent/a/01.flac", "A"),
            track("/nonexistent/a/02.flac", "A"),
            track("/nonexistent/b/01.flac", "B"),
            track("/nonexistent/c/01.flac", "C"),
            track("/nonexistent/c/02.flac", "C"),
        ]
    }

    fn seeded_writer(tracks: &[Track]) -> MemoryWriter {
        let writer = MemoryWriter::default();
        {
            let mut files = writer.files.lock().unwrap();
            for t in tracks {
                files.insert(t.path.clone(), t.tags.clone());
            }
        }
        writer
    }

    fn run(
        tracks: Vec<Track>,
        backend: &FakeBackend,
        writer: &MemoryWriter,
        jobs: usize,
        dry_run: bool,
    ) -> RunReport {
        let source = WorkSource::eager(group(tracks), GainMode::Auto, false);
        Scheduler::new(backend, writer, jobs)
            .run(source, &RunContext::quiet(dry_run))
            .unwrap()
    }

    #[test]
    fn second_run_is_a_no_op() {
        let tracks = library();
        let backend = FakeBackend::new();
        let writer = seeded_writer(&tracks);

        let first = run(tracks.clone(), &backend, &writer, 2, false);
        assert_eq!(first.analyzed, 3);
        assert!(first.success());
        assert_eq!(backend.calls(), 3);

        let second = run(writer.rescan(&tracks), &backend, &writer, 2, false);
        assert_eq!(backend.calls(), 3);
        assert_eq!(second.skipped, 3);
        assert_eq!(writer.writes(), 3);
    }

    #[test]
    fn one_failure_does_not_stop_the_others() {
        let backend = FakeBackend::failing("B");
        let writer = MemoryWriter::default();
        let report = run(library(), &backend, &writer, 3, false);

        assert_eq!(backend.calls(), 3);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.success());
        assert_eq!(writer.writes(), 2);

        let written = writer.snapshot();
        assert!(written.contains_key(Path::new("/nonexistent/a/01.flac")));
        assert!(written.contains_key(Path::new("/nonexistent/c/02.flac")));
        assert!(!written.contains_key(Path::new("/nonexistent/b/01.flac")));

        let failure = report.failures().next().unwrap();
        assert!(matches!(failure, WorkError::Backend { .. }));
        assert!(failure.to_string().contains("B by Artist"));
    }

    #[test]
    fn failure_in_dry_run_still_reports_others() {
        let backend = FakeBackend::failing("A");
        let writer = MemoryWriter::default();
        let report = run(library(), &backend, &writer, 2, true);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.success());
    }

    #[test]
    fn dry_run_never_writes() {
        let backend = FakeBackend::new();
        let writer = MemoryWriter::default();
        let report = run(library(), &backend, &writer, 2, true);

        assert_eq!(writer.writes(), 0);
        assert_eq!(report.analyzed, 3);
        for item in &report.items {
            match &item.outcome {
                Outcome::Updated { result: Some(r), written } => {
                    assert!(!written);
                    assert_eq!(r.tracks.len(), item.tracks);
                    assert!(r.album.is_some());
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn concurrency_does_not_change_final_tags() {
        let tracks: Vec<Track> = (0..12)
            .flat_map(|album| {
                (0..3).map(move |n| track(&format!("/nonexistent/{album}/{n:02}.flac"), &format!("Album {album}")))
            })
            .collect();

        let serial = seeded_writer(&tracks);
        run(tracks.clone(), &FakeBackend::new(), &serial, 1, false);
        let parallel = seeded_writer(&tracks);
        run(tracks, &FakeBackend::new(), &parallel, 4, false);

        assert_eq!(serial.snapshot(), parallel.snapshot());
    }

    #[test]
    fn track_mode_erases_album_tags_without_backend() {
        let mut tagged = track("/nonexistent/t/01.flac", "T");
        for (k, v) in [
            (TRACK_GAIN, "-3.00 dB"),
            (TRACK_PEAK, "0.500000"),
            (ALBUM_GAIN, "-4.00 dB"),
            (ALBUM_PEAK, "0.600000"),
        ] {
            tagged.tags.insert(k, v);
        }
        let backend = FakeBackend::new();
        let writer = seeded_writer(std::slice::from_ref(&tagged));

        let source = WorkSource::eager(group(vec![tagged.clone()]), GainMode::Track, false);
        let report = Scheduler::new(&backend, &writer, 1)
            .run(source, &RunContext::quiet(false))
            .unwrap();

        assert_eq!(backend.calls(), 0);
        assert_eq!(report.erased, 1);
        let bag = &writer.snapshot()[&tagged.path];
        assert_eq!(bag.get(TRACK_GAIN), Some("-3.00 dB"));
        assert!(!bag.contains(ALBUM_GAIN));
        assert!(!bag.contains(ALBUM_PEAK));
    }

    #[test]
    fn cancelled_run_dispatches_nothing() {
        let backend = FakeBackend::new();
        let writer = MemoryWriter::default();
        let ctx = RunContext::quiet(false);
        ctx.cancel();

        let source = WorkSource::eager(group(library()), GainMode::Auto, false);
        let report = Scheduler::new(&backend, &writer, 2).run(source, &ctx).unwrap();
        assert_eq!(backend.calls(), 0);
        assert_eq!(report.cancelled, 3);
        assert!(!report.success());
    }

    #[test]
    fn write_failure_marks_only_that_set_failed() {
        let backend = FakeBackend::new();
        let writer = MemoryWriter::read_only("/nonexistent/c");
        let report = run(library(), &backend, &writer, 2, false);

        assert_eq!(backend.calls(), 3);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.success());

        let written = writer.snapshot();
        assert!(written.contains_key(Path::new("/nonexistent/a/02.flac")));
        assert!(written.contains_key(Path::new("/nonexistent/b/01.flac")));
        assert!(!written.contains_key(Path::new("/nonexistent/c/01.flac")));

        let failure = report.failures().next().unwrap();
        assert!(matches!(failure, WorkError::Write { source: TagWriteError::ReadOnly(_), .. }));
        assert!(failure.to_string().contains("C by Artist"));
    }

    #[test]
    fn aborted_run_writes_nothing() {
        let backend = FakeBackend::new();
        let writer = MemoryWriter::default();
        let ctx = RunContext::quiet(false);
        // Abort lands after dispatch, while sets are being computed.
        ctx.interrupt_handle().abort_and_wait();
        let items = group(library())
            .into_iter()
            .map(|set| WorkItem::plan(set, GainMode::Auto, false))
            .collect::<Vec<_>>();
        let scheduler = Scheduler::new(&backend, &writer, 1);
        for item in items {
            assert!(matches!(scheduler.handle(&item, &ctx), Outcome::Cancelled));
        }
        assert_eq!(backend.calls(), 3);
        assert_eq!(writer.writes(), 0);
    }

    fn batches() -> Vec<DirectoryBatch> {
        let mut by_dir: BTreeMap<PathBuf, Vec<Track>> = BTreeMap::new();
        for t in library() {
            by_dir.entry(t.directory().to_path_buf()).or_default().push(t);
        }
        by_dir
            .into_iter()
            .map(|(directory, tracks)| DirectoryBatch {
                directory,
                tracks,
                errors: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn lazy_and_eager_agree() {
        let eager_writer = MemoryWriter::default();
        let eager = run(library(), &FakeBackend::new(), &eager_writer, 2, false);

        let lazy_writer = MemoryWriter::default();
        let counts = Arc::new(ScanCounts::default());
        let source = WorkSource::lazy(batches().into_iter(), GainMode::Auto, false, Arc::clone(&counts));
        assert!(source.total_tracks().is_none());
        let lazy = Scheduler::new(&FakeBackend::new(), &lazy_writer, 2)
            .run(source, &RunContext::quiet(false))
            .unwrap();

        assert_eq!(
            (eager.analyzed, eager.skipped, eager.failed),
            (lazy.analyzed, lazy.skipped, lazy.failed)
        );
        assert_eq!(eager_writer.snapshot(), lazy_writer.snapshot());
        assert_eq!(counts.tracks(), 5);
        assert_eq!(counts.errors(), 0);
    }

    #[test]
    fn lazy_run_keeps_only_failed_items() {
        let writer = MemoryWriter::default();
        let counts = Arc::new(ScanCounts::default());
        let source = WorkSource::lazy(batches().into_iter(), GainMode::Auto, false, counts);
        let report = Scheduler::new(&FakeBackend::failing("B"), &writer, 2)
            .run(source, &RunContext::quiet(false))
            .unwrap();

        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].key.album.as_deref(), Some("B"));
    }

    #[test]
    fn lazy_run_over_nothing_reports_no_tracks() {
        let counts = Arc::new(ScanCounts::default());
        let source = WorkSource::lazy(std::iter::empty::<DirectoryBatch>(), GainMode::Auto, false, Arc::clone(&counts));
        let report = Scheduler::new(&FakeBackend::new(), &MemoryWriter::default(), 2)
            .run(source, &RunContext::quiet(false))
            .unwrap();
        assert!(report.success());
        assert!(counts.ensure_tracks().is_err());
    }
}
