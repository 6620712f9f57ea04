//! Purpose: C ABI bridge for hosts embedding the notes runtime (libmdnotes).
//! Exports: `md_notes_runtime_{new,free,server_port,open_notes,close_notes}`.
//! Role: Stable ABI surface declared in `include/mdnotes.h`.
//! Invariants: Opaque handle; exactly one `md_notes_runtime_free` per successful `new`.
//! Invariants: Failures never unwind across the boundary: `new` returns null,
//! `server_port` returns 0, `open_notes` returns 0; the cause goes to the log.
//! Invariants: Null handles and null paths are tolerated everywhere.
#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::PathBuf;
use std::ptr;

use tracing::error;

use crate::core::error::{Error, ErrorKind, describe_chain};
use crate::runtime::{NotesRuntime, init_tracing};

#[repr(C)]
pub struct md_notes_runtime {
    runtime: NotesRuntime,
}

#[unsafe(no_mangle)]
pub extern "C" fn md_notes_runtime_new() -> *mut md_notes_runtime {
    init_tracing();
    match NotesRuntime::new() {
        Ok(runtime) => Box::into_raw(Box::new(md_notes_runtime { runtime })),
        Err(err) => {
            report("md_notes_runtime_new", &err);
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn md_notes_runtime_free(runtime: *mut md_notes_runtime) {
    if runtime.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(runtime));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn md_notes_runtime_server_port(runtime: *mut md_notes_runtime) -> u16 {
    match borrow_runtime(runtime) {
        Ok(runtime) => runtime.runtime.server_port(),
        Err(err) => {
            report("md_notes_runtime_server_port", &err);
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn md_notes_runtime_open_notes(
    runtime: *mut md_notes_runtime,
    raw_path: *const c_char,
) -> u8 {
    let result = borrow_runtime(runtime).and_then(|runtime| {
        let path = parse_path(raw_path)?;
        runtime.runtime.open_notes(path)
    });
    match result {
        Ok(notes_id) => notes_id,
        Err(err) => {
            report("md_notes_runtime_open_notes", &err);
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn md_notes_runtime_close_notes(runtime: *mut md_notes_runtime, notes_id: u8) {
    match borrow_runtime(runtime) {
        Ok(runtime) => {
            runtime.runtime.close_notes(notes_id);
        }
        Err(err) => report("md_notes_runtime_close_notes", &err),
    }
}

fn borrow_runtime<'a>(runtime: *mut md_notes_runtime) -> Result<&'a md_notes_runtime, Error> {
    if runtime.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message("runtime is null"));
    }
    unsafe { Ok(&*runtime) }
}

fn parse_path(input: *const c_char) -> Result<PathBuf, Error> {
    if input.is_null() {
        return Err(Error::new(ErrorKind::Usage).with_message("path is null"));
    }
    let raw = unsafe { CStr::from_ptr(input) }
        .to_str()
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("path is not valid UTF-8")
                .with_source(err)
        })?;
    if raw.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("path is empty"));
    }
    Ok(PathBuf::from(raw))
}

fn report(call: &str, err: &Error) {
    error!("{call} failed: {}", describe_chain(err));
}

#[cfg(test)]
mod tests {
    use super::{
        md_notes_runtime_close_notes, md_notes_runtime_free, md_notes_runtime_new,
        md_notes_runtime_open_notes, md_notes_runtime_server_port, parse_path,
    };
    use crate::core::error::ErrorKind;
    use std::ffi::CString;
    use std::ptr;

    #[test]
    fn null_handles_are_tolerated() {
        let path = CString::new("/tmp").expect("cstring");
        md_notes_runtime_free(ptr::null_mut());
        assert_eq!(md_notes_runtime_server_port(ptr::null_mut()), 0);
        assert_eq!(md_notes_runtime_open_notes(ptr::null_mut(), path.as_ptr()), 0);
        md_notes_runtime_close_notes(ptr::null_mut(), 1);
    }

    #[test]
    fn paths_must_be_non_null_utf8() {
        assert_eq!(parse_path(ptr::null()).expect_err("null").kind(), ErrorKind::Usage);

        let empty = CString::new("").expect("cstring");
        assert_eq!(parse_path(empty.as_ptr()).expect_err("empty").kind(), ErrorKind::Usage);

        let invalid = CString::new(vec![b'/', 0xff, 0xfe]).expect("cstring");
        assert_eq!(
            parse_path(invalid.as_ptr()).expect_err("utf-8").kind(),
            ErrorKind::Usage
        );

        let valid = CString::new("/srv/notes").expect("cstring");
        assert_eq!(
            parse_path(valid.as_ptr()).expect("path"),
            std::path::PathBuf::from("/srv/notes")
        );
    }

    #[test]
    fn create_then_free_once() {
        let runtime = md_notes_runtime_new();
        assert!(!runtime.is_null());
        assert_ne!(md_notes_runtime_server_port(runtime), 0);

        let missing = CString::new("/definitely/not/a/notes/dir").expect("cstring");
        assert_eq!(md_notes_runtime_open_notes(runtime, missing.as_ptr()), 0);
        md_notes_runtime_close_notes(runtime, 7);

        md_notes_runtime_free(runtime);
    }
}
