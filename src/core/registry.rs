//! Purpose: Track open notes collections by their one-byte id.
//! Exports: `NotesRegistry`, `IdAllocator`.
//! Role: Shared between the public runtime API and the HTTP handlers.
//! Invariants: Id `0` is never handed out; it is the C ABI failure sentinel.
//! Invariants: An id is reserved from `reserve` until `release`/`remove`, so it is never
//! shared by two live collections; allocation continues round-robin and wraps 255 -> 1.
//! Invariants: Map guards are never returned; callers get `Arc<Notes>` clones.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::core::error::{Error, ErrorKind};
use crate::core::notes::{Notes, NotesId, NotesSummary};

#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: NotesId,
    in_use: HashSet<NotesId>,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            in_use: HashSet::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<NotesId> {
        for _ in 0..u8::MAX {
            let candidate = self.next;
            self.next = if self.next == u8::MAX { 1 } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub(crate) fn release(&mut self, id: NotesId) -> bool {
        self.in_use.remove(&id)
    }
}

pub(crate) struct NotesRegistry {
    ids: Mutex<IdAllocator>,
    notes: DashMap<NotesId, Arc<Notes>>,
}

impl NotesRegistry {
    pub(crate) fn new() -> Self {
        Self {
            ids: Mutex::new(IdAllocator::new()),
            notes: DashMap::new(),
        }
    }

    pub(crate) fn reserve(&self) -> Result<NotesId, Error> {
        self.lock_ids().allocate().ok_or_else(|| {
            Error::new(ErrorKind::Busy)
                .with_message("all notes ids are in use")
                .with_hint("Close some notes before opening more.")
        })
    }

    pub(crate) fn release(&self, id: NotesId) {
        self.lock_ids().release(id);
    }

    pub(crate) fn insert(&self, notes: Arc<Notes>) {
        self.notes.insert(notes.id(), notes);
    }

    pub(crate) fn get(&self, id: NotesId) -> Option<Arc<Notes>> {
        self.notes.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: NotesId) -> Option<Arc<Notes>> {
        let (_, notes) = self.notes.remove(&id)?;
        self.release(id);
        Some(notes)
    }

    pub(crate) fn summaries(&self, addr: SocketAddr) -> Vec<NotesSummary> {
        let mut out: Vec<NotesSummary> = self
            .notes
            .iter()
            .map(|entry| entry.value().summary(addr))
            .collect();
        out.sort_by_key(|summary| summary.id);
        out
    }

    pub(crate) fn clear(&self) {
        let ids: Vec<NotesId> = self.notes.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, IdAllocator> {
        self.ids.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
