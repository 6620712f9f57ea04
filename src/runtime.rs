//! Purpose: The notes runtime: a loopback server plus the set of open notes collections.
//! Exports: `NotesRuntime`.
//! Role: Rust-facing owner behind the C ABI handle; all methods take `&self`.
//! Invariants: The server is running for the whole lifetime of a `NotesRuntime`.
//! Invariants: Dropping the runtime stops the server first, then closes every collection.
//! Invariants: `open_notes` never returns id `0`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Once};

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::core::builder::{BookBuilder, MdBookBuilder};
use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::notes::{self, Notes, NotesId, NotesSummary, OpenOptions};
use crate::core::registry::NotesRegistry;
use crate::login_env;
use crate::server::{self, ServerHandle};

static LOGIN_ENV: Once = Once::new();

pub struct NotesRuntime {
    registry: Arc<NotesRegistry>,
    builder: Arc<dyn BookBuilder>,
    config: RuntimeConfig,
    server_addr: SocketAddr,
    server: ServerHandle,
}

impl NotesRuntime {
    /// Starts a runtime with [`RuntimeConfig::from_env`] and the mdBook renderer.
    pub fn new() -> Result<Self, Error> {
        Self::with_config(RuntimeConfig::from_env()?)
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, Error> {
        Self::with_builder(config, Arc::new(MdBookBuilder))
    }

    pub fn with_builder(config: RuntimeConfig, builder: Arc<dyn BookBuilder>) -> Result<Self, Error> {
        config.validate()?;
        init_tracing();
        if config.import_login_env {
            LOGIN_ENV.call_once(login_env::import_login_environment);
        }

        let registry = Arc::new(NotesRegistry::new());
        let (server_addr, server) = server::spawn(&config, Arc::clone(&registry))?;

        Ok(Self {
            registry,
            builder,
            config,
            server_addr,
            server,
        })
    }

    pub fn server_port(&self) -> u16 {
        self.server_addr.port()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Builds the collection at `book_dir` and starts watching it.
    pub fn open_notes(&self, book_dir: impl Into<PathBuf>) -> Result<NotesId, Error> {
        let book_dir = book_dir.into();
        let root = std::fs::canonicalize(&book_dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("notes directory is not accessible")
                .with_path(&book_dir)
                .with_source(err)
        })?;
        if !root.is_dir() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("notes path is not a directory")
                .with_path(root));
        }

        let notes_id = self.registry.reserve()?;
        info!(notes_id, root = %root.display(), "loading notes");

        let options = OpenOptions {
            livereload_url: notes::livereload_url(self.server_addr, notes_id),
            builder: Arc::clone(&self.builder),
            debounce: self.config.debounce,
            broadcast_capacity: self.config.broadcast_capacity,
        };
        match Notes::open(notes_id, root, options) {
            Ok(notes) => {
                self.registry.insert(Arc::new(notes));
                Ok(notes_id)
            }
            Err(err) => {
                self.registry.release(notes_id);
                Err(err.with_notes_id(notes_id))
            }
        }
    }

    /// Returns `false` when `notes_id` was not open.
    pub fn close_notes(&self, notes_id: NotesId) -> bool {
        match self.registry.remove(notes_id) {
            Some(notes) => {
                drop(notes);
                info!(notes_id, "closed notes");
                true
            }
            None => {
                warn!(notes_id, "tried to close unknown notes id");
                false
            }
        }
    }

    pub fn notes_url(&self, notes_id: NotesId) -> String {
        notes::static_url(self.server_addr, notes_id)
    }

    pub fn list_notes(&self) -> Vec<NotesSummary> {
        self.registry.summaries(self.server_addr)
    }

    /// Live-reload events for an open collection; each rebuild sends `"reload"`.
    pub fn subscribe(&self, notes_id: NotesId) -> Option<broadcast::Receiver<String>> {
        self.registry.get(notes_id).map(|notes| notes.subscribe())
    }
}

impl Drop for NotesRuntime {
    fn drop(&mut self) {
        self.server.shutdown();
        self.registry.clear();
    }
}

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
