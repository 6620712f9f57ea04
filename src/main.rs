//! Purpose: `mdnotes` CLI entry point: serve one or more notes directories with live reload.
//! Role: Binary crate root; parses args, opens notes, prints their URLs, waits for a signal.
//! Invariants: Each opened collection is announced as one JSON line on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueHint};
use serde_json::{Map, Value, json};

use mdnotes::{Error, ErrorKind, NotesRuntime, RuntimeConfig, to_exit_code};

#[derive(Parser)]
#[command(
    name = "mdnotes",
    version,
    about = "Serve markdown notes as live-reloading HTML",
    long_about = None,
    after_help = r#"EXAMPLES
  $ mdnotes ~/notes
  {"id":1,"root":"/home/me/notes","html_dir":"/home/me/notes/book","url":"http://127.0.0.1:49152/1/static/","watching":true}

NOTES
  - Each directory is an mdBook (book.toml + src/SUMMARY.md).
  - Edits under src/, theme/ or book.toml rebuild the book and reload open pages.
  - MDNOTES_PORT pins the port; RUST_LOG controls log verbosity."#
)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1", help = "Address to bind the server to")]
    bind: IpAddr,
    #[arg(long, help = "Port to bind (default: MDNOTES_PORT or an ephemeral port)")]
    port: Option<u16>,
    #[arg(long, help = "Allow binding a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(required = true, value_hint = ValueHint::DirPath, help = "Notes directories to serve")]
    paths: Vec<PathBuf>,
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let mut config = RuntimeConfig::from_env()?.with_bind(cli.bind);
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    config.allow_non_loopback = cli.allow_non_loopback;

    let runtime = NotesRuntime::with_config(config)?;

    let mut opened = Vec::with_capacity(cli.paths.len());
    for path in &cli.paths {
        let notes_id = runtime.open_notes(path)?;
        opened.push(notes_id);
    }
    for summary in runtime.list_notes() {
        let line = serde_json::to_string(&summary).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode notes summary")
                .with_source(err)
        })?;
        println!("{line}");
    }

    wait_for_shutdown()?;

    for notes_id in opened {
        runtime.close_notes(notes_id);
    }
    Ok(())
}

fn wait_for_shutdown() -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start signal handler")
                .with_source(err)
        })?;
    runtime.block_on(shutdown_signal());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Build => "book build failed".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(notes_id) = err.notes_id() {
        inner.insert("notes_id".to_string(), json!(notes_id));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
