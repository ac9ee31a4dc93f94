//! Atomic file output.
//!
//! Every file the pipeline produces is first written in full to a hidden
//! sibling file and then renamed over the target, so readers only ever see
//! the previous version or the complete new one.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Component, Utf8Path};
use cap_std::fs::{Dir, OpenOptions};

use crate::error::WriteError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes `contents` to `path` inside `dir` atomically.
///
/// `path` must name a file directly inside `dir`.
///
/// # Errors
///
/// Returns [`WriteError`] if the temporary file cannot be written, synced or
/// renamed into place. The temporary file is removed on failure.
pub(crate) fn write_atomic(dir: &Dir, path: &Utf8Path, contents: &[u8]) -> Result<(), WriteError> {
    let file_name = single_file_name(path)?;
    let tmp_name = temp_name(file_name);

    write_temp(dir, &tmp_name, contents).map_err(|err| {
        discard(dir, &tmp_name);
        WriteError {
            path: path.with_file_name(&tmp_name),
            message: err.to_string(),
        }
    })?;

    replace(dir, &tmp_name, file_name).map_err(|err| {
        discard(dir, &tmp_name);
        WriteError {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    sync_directory(dir);
    Ok(())
}

/// Checks that a file can be created in `dir` by creating and removing a
/// probe file.
pub(crate) fn probe_writable(dir: &Dir) -> io::Result<()> {
    let probe = temp_name("probe");
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    drop(dir.open_with(&probe, &options)?);
    dir.remove_file(&probe)
}

fn single_file_name(path: &Utf8Path) -> Result<&str, WriteError> {
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Utf8Component::Normal(name)), None) => Ok(name),
        _ => Err(WriteError {
            path: path.to_path_buf(),
            message: "output path must name a file in the target directory".to_owned(),
        }),
    }
}

fn temp_name(file_name: &str) -> String {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    format!(".{file_name}.tmp.{}.{nanos}.{counter}", std::process::id())
}

fn write_temp(dir: &Dir, tmp_name: &str, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    let mut file = dir.open_with(tmp_name, &options)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(windows)]
fn replace(dir: &Dir, tmp_name: &str, target_name: &str) -> io::Result<()> {
    // Windows rename fails if the target exists.
    match dir.remove_file(target_name) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    dir.rename(tmp_name, dir, target_name)
}

#[cfg(not(windows))]
fn replace(dir: &Dir, tmp_name: &str, target_name: &str) -> io::Result<()> {
    dir.rename(tmp_name, dir, target_name)
}

fn sync_directory(dir: &Dir) {
    if dir.open(".").and_then(|handle| handle.sync_all()).is_err() {
        // Best effort: the rename has already happened.
    }
}

fn discard(dir: &Dir, tmp_name: &str) {
    if dir.remove_file(tmp_name).is_err() {
        // Nothing was left behind, or cleanup is impossible.
    }
}
