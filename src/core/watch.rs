//! Purpose: Rebuild a notes collection when its sources change and announce reloads.
//! Exports: `NotesWatcher`, `WatchTask`, `start`.
//! Role: One notify watcher plus one thread per open collection.
//! Invariants: Dropping `NotesWatcher` drops the notify watcher, which disconnects the
//! event channel and ends the thread; the shutdown flag covers backends that linger.
//! Invariants: Paths ignored by the nearest `.gitignore` never trigger a rebuild.
//! Notes: A failed rebuild still broadcasts `reload` so the page reflects the latest state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::core::builder::{BookBuilder, BookLayout};
use crate::core::error::{Error, ErrorKind, describe_chain};
use crate::core::notes::NotesId;

pub(crate) const RELOAD_EVENT: &str = "reload";

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

pub(crate) struct WatchTask {
    pub(crate) notes_id: NotesId,
    pub(crate) layout: BookLayout,
    pub(crate) livereload_url: String,
    pub(crate) builder: Arc<dyn BookBuilder>,
    pub(crate) broadcast: broadcast::Sender<String>,
    pub(crate) debounce: Duration,
}

pub(crate) struct NotesWatcher {
    _watcher: RecommendedWatcher,
    shutdown: Arc<AtomicBool>,
}

impl Drop for NotesWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Returns `Ok(None)` when none of the layout's watch paths could be watched.
pub(crate) fn start(task: WatchTask) -> Result<Option<NotesWatcher>, Error> {
    let (sender, receiver) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(sender).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create filesystem watcher")
            .with_notes_id(task.notes_id)
            .with_source(err)
    })?;

    let mut watching_something = false;
    for watch_path in &task.layout.watch_paths {
        match watcher.watch(watch_path, RecursiveMode::Recursive) {
            Ok(()) => watching_something = true,
            Err(err) => warn!(path = %watch_path.display(), "couldn't watch notes path: {err}"),
        }
    }

    if !watching_something {
        warn!(
            notes_id = task.notes_id,
            root = %task.layout.root.display(),
            "nothing to watch, live reload disabled"
        );
        return Ok(None);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let thread_shutdown = Arc::clone(&shutdown);
    let notes_id = task.notes_id;
    thread::Builder::new()
        .name(format!("mdnotes-watch-{notes_id}"))
        .spawn(move || watch_loop(receiver, thread_shutdown, task))
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to spawn watcher thread")
                .with_notes_id(notes_id)
                .with_source(err)
        })?;

    Ok(Some(NotesWatcher {
        _watcher: watcher,
        shutdown,
    }))
}

fn watch_loop(
    receiver: Receiver<notify::Result<Event>>,
    shutdown: Arc<AtomicBool>,
    task: WatchTask,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match receiver.recv_timeout(SHUTDOWN_POLL) {
            Ok(first_event) => {
                // let editors finish writing, then take everything queued so far
                thread::sleep(task.debounce);
                let events = std::iter::once(first_event).chain(receiver.try_iter());
                let paths = changed_paths(events);

                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let gitignore = load_gitignore(&task.layout.root);
                if found_unignored_files(&paths, gitignore.as_ref()) {
                    rebuild(&task);
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(
        notes_id = task.notes_id,
        root = %task.layout.root.display(),
        "stopped watching notes"
    );
}

fn rebuild(task: &WatchTask) {
    debug!(notes_id = task.notes_id, root = %task.layout.root.display(), "rebuilding notes");
    if let Err(err) = task.builder.build(&task.layout.root, &task.livereload_url) {
        warn!(
            notes_id = task.notes_id,
            "couldn't rebuild notes: {}",
            describe_chain(&err)
        );
    }
    // an error only means nobody is listening
    let _ = task.broadcast.send(RELOAD_EVENT.to_string());
}

pub(crate) fn changed_paths<I>(events: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = notify::Result<Event>>,
{
    let mut paths = Vec::new();
    for event in events {
        match event {
            Ok(event) => {
                trace!("received filesystem event: {event:?}");
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    paths.extend(event.paths);
                }
            }
            Err(err) => warn!("filesystem watch error: {err}"),
        }
    }
    paths
}

/// Nearest `.gitignore` at or above `root`.
pub(crate) fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let gitignore_path = root
        .ancestors()
        .map(|dir| dir.join(".gitignore"))
        .find(|path| path.is_file())?;
    let base = gitignore_path.parent()?;

    let mut builder = GitignoreBuilder::new(base);
    if let Some(err) = builder.add(&gitignore_path) {
        warn!(path = %gitignore_path.display(), "partially parsed .gitignore: {err}");
    }
    match builder.build() {
        Ok(gitignore) => Some(gitignore),
        Err(err) => {
            warn!(path = %gitignore_path.display(), "couldn't parse .gitignore: {err}");
            None
        }
    }
}

pub(crate) fn found_unignored_files(paths: &[PathBuf], gitignore: Option<&Gitignore>) -> bool {
    let Some(gitignore) = gitignore else {
        return !paths.is_empty();
    };
    paths.iter().any(|path| {
        // matching panics outside the gitignore root
        if !path.starts_with(gitignore.path()) {
            return true;
        }
        !gitignore
            .matched_path_or_any_parents(path, path.is_dir())
            .is_ignore()
    })
}
