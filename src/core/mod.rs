// Core modules: notes lifecycle, id registry, book building, fs watching, errors.
pub mod builder;
pub mod error;
pub mod notes;
pub(crate) mod registry;
pub(crate) mod watch;
