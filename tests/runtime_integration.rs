//! Purpose: End-to-end tests for the notes runtime over its loopback HTTP server.
//! Exports: None (integration test module).
//! Role: Validate open/serve/close, id allocation, path safety, and rebuild-on-edit.
//! Invariants: Uses a fake builder so tests do not depend on mdBook output details.
//! Invariants: Bounded waits avoid test flakiness.

use mdnotes::{BookBuilder, BookLayout, Error, ErrorKind, NotesRuntime, RuntimeConfig};
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Renders `src/*.md` verbatim into `book/*.html`.
#[derive(Default)]
struct CopyBuilder {
    builds: AtomicUsize,
}

impl BookBuilder for CopyBuilder {
    fn build(&self, root: &Path, livereload_url: &str) -> Result<BookLayout, Error> {
        let source_dir = root.join("src");
        let html_dir = root.join("book");
        let io_err = |err: std::io::Error| {
            Error::new(ErrorKind::Io)
                .with_message("copy build failed")
                .with_source(err)
        };
        fs::create_dir_all(&source_dir).map_err(io_err)?;
        fs::create_dir_all(&html_dir).map_err(io_err)?;
        for entry in fs::read_dir(&source_dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            let body = fs::read_to_string(&path).map_err(io_err)?;
            let Some(stem) = path.file_stem() else {
                continue;
            };
            let target = html_dir.join(stem).with_extension("html");
            fs::write(target, format!("<html data-reload=\"{livereload_url}\">{body}</html>"))
                .map_err(io_err)?;
        }
        fs::write(html_dir.join("index.html"), "<html>index</html>").map_err(io_err)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(BookLayout {
            root: root.to_path_buf(),
            html_dir,
            watch_paths: vec![source_dir],
        })
    }
}

// field order matters: the runtime must stop before the scratch dir is removed
struct Fixture {
    runtime: NotesRuntime,
    builder: Arc<CopyBuilder>,
    notes_dir: PathBuf,
    temp: tempfile::TempDir,
}

impl Fixture {
    fn new() -> TestResult<Self> {
        let temp = tempfile::tempdir()?;
        let notes_dir = temp.path().join("notes");
        fs::create_dir_all(notes_dir.join("src"))?;
        fs::write(notes_dir.join("src").join("intro.md"), "hello notes")?;
        fs::write(temp.path().join("secret.txt"), "do not serve")?;

        let builder = Arc::new(CopyBuilder::default());
        let config = RuntimeConfig::default().with_import_login_env(false);
        let runtime = NotesRuntime::with_builder(config, builder.clone())?;
        Ok(Self {
            runtime,
            builder,
            notes_dir,
            temp,
        })
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.runtime.server_port())
    }

    fn extra_notes_dir(&self, name: &str) -> TestResult<PathBuf> {
        let dir = self.temp.path().join(name);
        fs::create_dir_all(dir.join("src"))?;
        Ok(dir)
    }
}

fn get_status(url: &str) -> u16 {
    match ureq::get(url).call() {
        Ok(response) => response.status(),
        Err(ureq::Error::Status(code, _)) => code,
        Err(err) => panic!("request to {url} failed: {err}"),
    }
}

fn get_body(url: &str) -> TestResult<String> {
    Ok(ureq::get(url).call()?.into_string()?)
}

const WS_TEXT: u8 = 0x1;
const WS_CLOSE: u8 = 0x8;

/// Plain websocket client: enough of RFC 6455 to read unmasked server frames.
struct LiveReloadSocket {
    stream: TcpStream,
}

impl LiveReloadSocket {
    fn connect(port: u16, notes_id: &str) -> TestResult<Self> {
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let request = format!(
            "GET /{notes_id}/ws HTTP/1.1\r\n\
             Host: 127.0.0.1:{port}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        );
        stream.write_all(request.as_bytes())?;

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte)?;
            head.push(byte[0]);
        }
        let head = String::from_utf8(head)?;
        if !head.starts_with("HTTP/1.1 101") {
            return Err(format!("upgrade refused: {head}").into());
        }
        Ok(Self { stream })
    }

    /// Returns the opcode and payload of the next frame.
    fn next_frame(&mut self) -> TestResult<(u8, Vec<u8>)> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header)?;
        let opcode = header[0] & 0x0f;
        let len = match header[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext)?;
                u16::from_be_bytes(ext) as usize
            }
            127 => return Err("unexpectedly large frame".into()),
            len => len as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((opcode, payload))
    }
}

#[test]
fn open_serves_rendered_notes_until_closed() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    assert_eq!(notes_id, 1);

    let index_url = fixture.runtime.notes_url(notes_id);
    assert_eq!(index_url, format!("{}/1/static/", fixture.base_url()));
    assert_eq!(get_body(&index_url)?, "<html>index</html>");

    let response = ureq::get(&format!("{index_url}intro.html")).call()?;
    assert_eq!(response.content_type(), "text/html");
    let body = response.into_string()?;
    assert!(body.contains("hello notes"));
    assert!(body.contains(&format!(
        "ws://127.0.0.1:{}/1/ws",
        fixture.runtime.server_port()
    )));

    assert!(fixture.runtime.close_notes(notes_id));
    assert_eq!(get_status(&index_url), 404);
    assert!(!fixture.runtime.close_notes(notes_id));
    Ok(())
}

#[test]
fn static_without_trailing_slash_redirects() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;

    // ureq follows the redirect to the index
    let body = get_body(&format!("{}/{notes_id}/static", fixture.base_url()))?;
    assert_eq!(body, "<html>index</html>");
    Ok(())
}

#[test]
fn unknown_ids_and_traversal_are_not_found() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let base = fixture.base_url();

    assert_eq!(get_status(&format!("{base}/9/static/")), 404);
    assert_eq!(get_status(&format!("{base}/0/static/")), 404);
    assert_eq!(get_status(&format!("{base}/notes/static/")), 404);
    assert_eq!(get_status(&format!("{base}/{notes_id}/static/missing.html")), 404);
    assert_eq!(
        get_status(&format!("{base}/{notes_id}/static/..%2F..%2Fsecret.txt")),
        404
    );
    assert_eq!(
        get_status(&format!("{base}/{notes_id}/static/%2E%2E/%2E%2E/secret.txt")),
        404
    );
    Ok(())
}

#[test]
fn ids_are_unique_nonzero_and_not_immediately_reused() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let second_dir = fixture.extra_notes_dir("second")?;
    let third_dir = fixture.extra_notes_dir("third")?;

    let first = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let second = fixture.runtime.open_notes(&second_dir)?;
    assert_eq!((first, second), (1, 2));

    assert!(fixture.runtime.close_notes(first));
    let third = fixture.runtime.open_notes(&third_dir)?;
    assert_eq!(third, 3);

    let ids: Vec<u8> = fixture
        .runtime
        .list_notes()
        .iter()
        .map(|summary| summary.id)
        .collect();
    assert_eq!(ids, vec![2, 3]);
    Ok(())
}

#[test]
fn healthz_and_notes_listing() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let base = fixture.base_url();

    let health: Value = serde_json::from_str(&get_body(&format!("{base}/healthz"))?)?;
    assert_eq!(health["ok"], Value::Bool(true));

    let listing: Value = serde_json::from_str(&get_body(&format!("{base}/v0/notes"))?)?;
    let notes = listing["notes"].as_array().ok_or("notes array")?;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["id"], Value::from(notes_id));
    assert_eq!(
        notes[0]["url"],
        Value::from(fixture.runtime.notes_url(notes_id))
    );
    assert_eq!(notes[0]["watching"], Value::Bool(true));
    let root = fs::canonicalize(&fixture.notes_dir)?;
    assert_eq!(notes[0]["root"], Value::from(root.display().to_string()));
    Ok(())
}

#[test]
fn source_edit_rebuilds_and_broadcasts_reload() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let mut reloads = fixture.runtime.subscribe(notes_id).ok_or("subscribe")?;
    assert_eq!(fixture.builder.builds.load(Ordering::SeqCst), 1);

    fs::write(
        fixture.notes_dir.join("src").join("intro.md"),
        "edited notes",
    )?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let event = loop {
        match reloads.try_recv() {
            Ok(event) => break event,
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return Err("timed out waiting for reload".into());
                }
                sleep(Duration::from_millis(25));
            }
            Err(err) => return Err(err.into()),
        }
    };
    assert_eq!(event, "reload");
    assert!(fixture.builder.builds.load(Ordering::SeqCst) >= 2);

    let body = get_body(&format!(
        "{}intro.html",
        fixture.runtime.notes_url(notes_id)
    ))?;
    assert!(body.contains("edited notes"));
    Ok(())
}

#[test]
fn closing_notes_ends_live_reload_subscriptions() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let mut reloads = fixture.runtime.subscribe(notes_id).ok_or("subscribe")?;

    assert!(fixture.runtime.close_notes(notes_id));
    assert!(fixture.runtime.subscribe(notes_id).is_none());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match reloads.try_recv() {
            Err(tokio::sync::broadcast::error::TryRecvError::Closed) => break,
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return Err("subscription stayed open after close".into());
                }
                sleep(Duration::from_millis(25));
            }
            other => return Err(format!("unexpected event: {other:?}").into()),
        }
    }
    Ok(())
}

#[tokio::test]
async fn runtime_can_be_dropped_inside_an_async_context() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    assert_ne!(notes_id, 0);
    drop(fixture);
    Ok(())
}

#[test]
fn websocket_forwards_reloads_and_closes_with_the_notes() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let notes_id = fixture.runtime.open_notes(&fixture.notes_dir)?;
    let mut socket = LiveReloadSocket::connect(
        fixture.runtime.server_port(),
        &notes_id.to_string(),
    )?;

    fs::write(
        fixture.notes_dir.join("src").join("intro.md"),
        "edited for the socket",
    )?;
    let (opcode, payload) = socket.next_frame()?;
    assert_eq!(opcode, WS_TEXT);
    assert_eq!(payload, b"reload");

    assert!(fixture.runtime.close_notes(notes_id));
    // one edit can surface as several reloads before the close arrives
    loop {
        let (opcode, payload) = socket.next_frame()?;
        if opcode == WS_CLOSE {
            break;
        }
        assert_eq!((opcode, payload.as_slice()), (WS_TEXT, b"reload".as_slice()));
    }
    Ok(())
}

#[test]
fn websocket_for_unknown_notes_closes_at_once() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let port = fixture.runtime.server_port();

    for raw_id in ["9", "0", "notes"] {
        let mut socket = LiveReloadSocket::connect(port, raw_id)?;
        let (opcode, _) = socket.next_frame()?;
        assert_eq!(opcode, WS_CLOSE, "{raw_id}");
    }
    Ok(())
}
