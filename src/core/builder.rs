//! Purpose: Render a notes directory into static HTML.
//! Exports: `BookBuilder`, `BookLayout`, `MdBookBuilder`.
//! Role: Seam between the runtime and the markdown renderer; tests plug in fakes.
//! Invariants: `build` is synchronous and may be called again on the same root to rebuild.
//! Invariants: The live-reload URL is injected on every build, not only the first.

use std::path::{Path, PathBuf};

use mdbook::MDBook;

use crate::core::error::{Error, ErrorKind};

/// Where a built collection lives on disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BookLayout {
    pub root: PathBuf,
    /// Directory served under `/{id}/static/`.
    pub html_dir: PathBuf,
    /// Paths whose changes should trigger a rebuild.
    pub watch_paths: Vec<PathBuf>,
}

pub trait BookBuilder: Send + Sync + 'static {
    fn build(&self, root: &Path, livereload_url: &str) -> Result<BookLayout, Error>;
}

/// Builds an mdBook with its html backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct MdBookBuilder;

impl BookBuilder for MdBookBuilder {
    fn build(&self, root: &Path, livereload_url: &str) -> Result<BookLayout, Error> {
        let mut book =
            MDBook::load(root).map_err(|err| build_error("failed to load book", root, err))?;
        book.config
            .set("output.html.livereload-url", livereload_url)
            .map_err(|err| build_error("failed to configure live reload", root, err))?;
        book.build()
            .map_err(|err| build_error("failed to build book", root, err))?;

        Ok(BookLayout {
            root: book.root.clone(),
            html_dir: book.build_dir_for("html"),
            watch_paths: vec![
                book.source_dir(),
                book.theme_dir(),
                book.root.join("book.toml"),
            ],
        })
    }
}

fn build_error(message: &str, root: &Path, err: mdbook::errors::Error) -> Error {
    Error::new(ErrorKind::Build)
        .with_message(message)
        .with_path(root)
        .with_boxed_source(err.into())
}
