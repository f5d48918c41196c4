use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("{} is locked by another writer ({})", path.display(), lock.display())]
    Locked { path: PathBuf, lock: PathBuf },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize line for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Exclusive line-delimited JSON writer.
///
/// Holds an exclusive advisory lock on a `<file>.lock` sibling for its
/// lifetime; a second writer on the same file fails with
/// [`JsonlError::Locked`]. The lock belongs to the open handle, so a writer
/// that dies without cleaning up leaves no lock behind, only the file. Each
/// value is written as one line with a single `write_all` followed by a flush.
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    lock: PathBuf,
    lock_file: File,
    file: File,
    lines: usize,
}

impl JsonlWriter {
    /// Opens `path` for appending, or truncates it when `append` is false.
    pub fn open(path: &Path, append: bool) -> Result<Self, JsonlError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| JsonlError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock = lock_path(path);
        let lock_io = |source: std::io::Error| JsonlError::Io {
            path: lock.clone(),
            source,
        };
        let mut lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock)
            .map_err(lock_io)?;
        if let Err(source) = lock_file.try_lock_exclusive() {
            let contended = source.kind() == ErrorKind::WouldBlock
                || source.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            return Err(if contended {
                JsonlError::Locked {
                    path: path.to_path_buf(),
                    lock: lock.clone(),
                }
            } else {
                lock_io(source)
            });
        }
        lock_file
            .set_len(0)
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(lock_io)?;

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(path).map_err(|source| JsonlError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), append, "opened jsonl writer");
        Ok(Self {
            path: path.to_path_buf(),
            lock,
            lock_file,
            file,
            lines: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), JsonlError> {
        let mut line = serde_json::to_string(value).map_err(|source| JsonlError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|source| JsonlError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.lines += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> usize {
        self.lines
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.lock_file) {
            warn!(lock = %self.lock.display(), %error, "failed to release jsonl lock");
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Lines that decoded plus the count of lines that did not.
#[derive(Debug)]
pub struct JsonlContents<T> {
    pub items: Vec<T>,
    pub skipped: usize,
}

/// Reads every line of `path` as `T`. Blank lines are ignored; lines that do
/// not decode are logged with their line number and skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<JsonlContents<T>, JsonlError> {
    let io_error = |source: std::io::Error| JsonlError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_error)?);

    let mut contents = JsonlContents {
        items: Vec::new(),
        skipped: 0,
    };
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(item) => contents.items.push(item),
            Err(error) => {
                warn!(path = %path.display(), line = index + 1, %error, "skipping invalid line");
                contents.skipped += 1;
            }
        }
    }

    Ok(contents)
}
