//! Purpose: Serve files out of a collection's rendered HTML directory.
//! Exports: `serve_file`, `sanitize_path`, `http_date`.
//! Role: Backing for `GET /{id}/static/{tail}`; the router resolves the directory.
//! Invariants: Never resolves outside the base directory (`..` and `\` segments rejected).
//! Invariants: Every open/read failure surfaces as `NotFound`; only the log level differs.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use axum::body::Body;
use axum::http::HeaderValue;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use axum::response::Response;
use bytes::Bytes;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, warn};

use crate::core::error::{Error, ErrorKind};

pub(crate) async fn serve_file(base: &Path, tail: &str) -> Result<Response, Error> {
    let mut file_path = sanitize_path(base, tail)?;
    let is_dir = tokio::fs::metadata(&file_path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if is_dir {
        file_path.push("index.html");
    }

    file_reply(file_path).await
}

/// `tail` arrives already percent-decoded by the router.
pub(crate) fn sanitize_path(base: &Path, tail: &str) -> Result<PathBuf, Error> {
    let mut buf = base.to_path_buf();
    for seg in tail.split('/') {
        if seg.starts_with("..") {
            warn!("static: rejecting segment starting with '..'");
            return Err(not_found(tail));
        } else if seg.contains('\\') {
            warn!("static: rejecting segment containing a backslash");
            return Err(not_found(tail));
        } else if !seg.is_empty() {
            buf.push(seg);
        }
    }
    Ok(buf)
}

async fn file_reply(path: PathBuf) -> Result<Response, Error> {
    let opened = match tokio::fs::metadata(&path).await {
        Ok(meta) => tokio::fs::read(&path).await.map(|contents| (meta, contents)),
        Err(err) => Err(err),
    };
    let (meta, contents) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            match err.kind() {
                std::io::ErrorKind::NotFound => debug!("file not found: {}", path.display()),
                std::io::ErrorKind::PermissionDenied => {
                    warn!("file permission denied: {}", path.display())
                }
                _ => error!("file open error (path={}): {err}", path.display()),
            }
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("file not found")
                .with_path(path));
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let len = contents.len() as u64;

    let mut response = Response::new(Body::from(Bytes::from(contents)));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    if let Some(value) = meta
        .modified()
        .ok()
        .and_then(http_date)
        .and_then(|date| HeaderValue::from_str(&date).ok())
    {
        headers.insert(LAST_MODIFIED, value);
    }
    Ok(response)
}

pub(crate) fn http_date(time: SystemTime) -> Option<String> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::from(time).format(&format).ok()
}

fn not_found(tail: &str) -> Error {
    Error::new(ErrorKind::NotFound).with_message(format!("no such file: {tail}"))
}
