//! Purpose: One opened notes collection: built HTML, live-reload channel, fs watcher.
//! Exports: `Notes`, `NotesId`, `NotesSummary`.
//! Role: Owned by the registry; shared with HTTP handlers through `Arc`.
//! Invariants: Dropping `Notes` stops its watcher; websocket subscribers then see the
//! channel close once the watcher thread exits.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::builder::{BookBuilder, BookLayout};
use crate::core::error::Error;
use crate::core::watch::{self, NotesWatcher, WatchTask};

pub type NotesId = u8;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NotesSummary {
    pub id: NotesId,
    pub root: String,
    pub html_dir: String,
    pub url: String,
    /// `false` when none of the book's paths could be watched; edits then need a reopen.
    pub watching: bool,
}

pub(crate) struct OpenOptions {
    pub(crate) livereload_url: String,
    pub(crate) builder: Arc<dyn BookBuilder>,
    pub(crate) debounce: Duration,
    pub(crate) broadcast_capacity: usize,
}

pub struct Notes {
    id: NotesId,
    layout: BookLayout,
    broadcast: broadcast::Sender<String>,
    watcher: Option<NotesWatcher>,
}

impl Notes {
    pub(crate) fn open(id: NotesId, root: PathBuf, options: OpenOptions) -> Result<Self, Error> {
        let layout = options.builder.build(&root, &options.livereload_url)?;

        // the initial receiver is not needed, subscribers come from websockets
        let (broadcast, _) = broadcast::channel::<String>(options.broadcast_capacity);

        let watcher = watch::start(WatchTask {
            notes_id: id,
            layout: layout.clone(),
            livereload_url: options.livereload_url,
            builder: options.builder,
            broadcast: broadcast.clone(),
            debounce: options.debounce,
        })?;

        Ok(Self {
            id,
            layout,
            broadcast,
            watcher,
        })
    }

    pub fn id(&self) -> NotesId {
        self.id
    }

    pub fn html_dir(&self) -> &Path {
        &self.layout.html_dir
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast.subscribe()
    }

    pub(crate) fn summary(&self, addr: SocketAddr) -> NotesSummary {
        NotesSummary {
            id: self.id,
            root: self.layout.root.display().to_string(),
            html_dir: self.layout.html_dir.display().to_string(),
            url: static_url(addr, self.id),
            watching: self.is_watching(),
        }
    }
}

/// Browsers cannot connect to an unspecified address, so point them at loopback.
fn reachable_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

pub(crate) fn static_url(addr: SocketAddr, id: NotesId) -> String {
    format!("http://{}/{id}/static/", reachable_addr(addr))
}

pub(crate) fn livereload_url(addr: SocketAddr, id: NotesId) -> String {
    format!("ws://{}/{id}/ws", reachable_addr(addr))
}
