use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Per-run state handed to the scheduler by reference.
///
/// Created once in `main`; nothing in the library reaches for globals.
pub struct RunContext {
    pub dry_run: bool,
    signals: Arc<Signals>,
    progress: ProgressBar,
}

#[derive(Debug, Default)]
struct Signals {
    cancel: AtomicBool,
    abort: AtomicBool,
    writes: AtomicUsize,
}

impl RunContext {
    pub fn new(dry_run: bool, show_progress: bool) -> Self {
        let progress = if show_progress {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        Self {
            dry_run,
            signals: Arc::default(),
            progress,
        }
    }

    /// Context with no visible output, for tests and library callers.
    pub fn quiet(dry_run: bool) -> Self {
        Self::new(dry_run, false)
    }

    /// Handle for the interrupt handler.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            signals: Arc::clone(&self.signals),
        }
    }

    pub fn cancel(&self) {
        self.signals.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.signals.cancel.load(Ordering::SeqCst)
    }

    /// Mark a tag write as in progress until the guard drops.
    ///
    /// Returns `None` once an abort has been requested; the caller must not
    /// start writing.
    pub fn begin_write(&self) -> Option<WriteGuard<'_>> {
        self.signals.writes.fetch_add(1, Ordering::SeqCst);
        let guard = WriteGuard(&self.signals.writes);
        if self.signals.abort.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    pub fn progress(&self) -> &ProgressBar {
        &self.progress
    }

    /// Switch the progress display to a bar over `total` tracks.
    pub fn start_bar(&self, total: u64) {
        self.progress.set_length(total);
        self.progress.set_position(0);
        self.progress.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tracks ({percent}%) ({eta}) {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
    }

    /// Switch the progress display to an open-ended spinner.
    pub fn start_spinner(&self) {
        self.progress.set_position(0);
        self.progress.set_style(
            ProgressStyle::with_template("{spinner:.green} {pos} tracks ({per_sec}) {msg}").unwrap(),
        );
    }
}

/// Held while one track set's tags are being saved.
pub struct WriteGuard<'a>(&'a AtomicUsize);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cancellation side of a [`RunContext`], safe to move into a signal handler.
#[derive(Clone)]
pub struct InterruptHandle {
    signals: Arc<Signals>,
}

impl InterruptHandle {
    /// Stop dispatching new work. Returns true if this was already requested.
    pub fn interrupt(&self) -> bool {
        self.signals.cancel.swap(true, Ordering::SeqCst)
    }

    /// Refuse new tag writes, then block until in-progress ones finish.
    pub fn abort_and_wait(&self) {
        self.signals.cancel.store(true, Ordering::SeqCst);
        self.signals.abort.store(true, Ordering::SeqCst);
        while self.signals.writes.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
