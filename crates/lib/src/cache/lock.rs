//! Keeps two arbor processes from driving the same cache at once.
//!
//! Commands that write outputs or the cache (`build`, `watch`, `clean`)
//! take a write lock and record who they are in the lock file, so a second
//! command can say which pipeline is holding it. Read-only commands share
//! the lock, and take none at all when the cache does not exist yet: a
//! `plan` against a fresh checkout leaves nothing behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Reads the cache and output records (`plan`, `graph`).
  Read,
  /// Writes outputs and saves the cache (`build`, `watch`, `clean`).
  Write,
}

/// Who holds a write lock. Stored as JSON in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
  pub pid: u32,
  pub command: String,
  pub pipeline: PathBuf,
  pub outputs: Vec<PathBuf>,
  pub started_at_unix: u64,
}

impl LockOwner {
  /// The current process running `command` over `pipeline`.
  pub fn current(command: &str, pipeline: &Path, outputs: Vec<PathBuf>) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      pipeline: pipeline.to_path_buf(),
      outputs,
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }
}

fn describe(holder: &Option<LockOwner>) -> String {
  match holder {
    Some(owner) => format!(
      "`arbor {}` (PID {}) on {}",
      owner.command,
      owner.pid,
      owner.pipeline.display()
    ),
    None => "another arbor process".to_string(),
  }
}

#[derive(Debug, Error)]
pub enum CacheLockError {
  #[error(
    "cache is in use by {}\nIf that process is gone, remove the lock file:\n  {}",
    describe(.holder),
    .lock_path.display()
  )]
  Busy {
    holder: Option<LockOwner>,
    lock_path: PathBuf,
  },

  #[error("failed to {action} '{}': {source}", .path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> CacheLockError + 'a {
  move |source| CacheLockError::Io {
    action,
    path: path.to_path_buf(),
    source,
  }
}

/// Released on drop.
#[derive(Debug)]
pub struct CacheLock {
  /// `None` for a read lock over a cache that does not exist.
  file: Option<File>,
  lock_path: PathBuf,
}

impl CacheLock {
  /// Take the lock in `cache_dir` without blocking.
  pub fn acquire(cache_dir: &Path, mode: LockMode, owner: &LockOwner) -> Result<Self, CacheLockError> {
    let lock_path = cache_dir.join(LOCK_FILENAME);

    if mode == LockMode::Read && !cache_dir.is_dir() {
      debug!(cache = %cache_dir.display(), "no cache yet, nothing to lock");
      return Ok(Self { file: None, lock_path });
    }
    fs::create_dir_all(cache_dir).map_err(io_error("create", cache_dir))?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(io_error("open", &lock_path))?;

    match sys::try_lock(&file, mode == LockMode::Write) {
      Ok(true) => {}
      Ok(false) => {
        return Err(CacheLockError::Busy {
          holder: read_owner(&lock_path),
          lock_path,
        });
      }
      Err(source) => return Err(io_error("lock", &lock_path)(source)),
    }

    if mode == LockMode::Write {
      file.set_len(0).map_err(io_error("write", &lock_path))?;
      let mut writer = io::BufWriter::new(&file);
      serde_json::to_writer_pretty(&mut writer, owner)
        .map_err(io::Error::other)
        .and_then(|()| writer.flush())
        .map_err(io_error("write", &lock_path))?;
    }

    debug!(lock = %lock_path.display(), ?mode, "cache locked");
    Ok(Self {
      file: Some(file),
      lock_path,
    })
  }

  pub fn is_held(&self) -> bool {
    self.file.is_some()
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  /// The owner recorded by a write lock, read through the held handle
  /// (Windows refuses a second handle on a locked file).
  pub fn owner(&self) -> Option<LockOwner> {
    let mut file = self.file.as_ref()?;
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
  }
}

fn read_owner(lock_path: &Path) -> Option<LockOwner> {
  let contents = fs::read_to_string(lock_path).ok()?;
  serde_json::from_str(&contents).ok()
}

/// `try_lock` returns `Ok(false)` when another process holds a conflicting lock.
#[cfg(unix)]
mod sys {
  use std::fs::File;
  use std::io;
  use std::os::unix::io::AsFd;

  use rustix::fs::{FlockOperation, flock};

  pub fn try_lock(file: &File, exclusive: bool) -> io::Result<bool> {
    let operation = if exclusive {
      FlockOperation::NonBlockingLockExclusive
    } else {
      FlockOperation::NonBlockingLockShared
    };
    match flock(file.as_fd(), operation) {
      Ok(()) => Ok(true),
      Err(errno) if errno == rustix::io::Errno::WOULDBLOCK => Ok(false),
      Err(errno) => Err(io::Error::from_raw_os_error(errno.raw_os_error())),
    }
  }
}

#[cfg(windows)]
mod sys {
  use std::fs::File;
  use std::io;
  use std::os::windows::io::AsRawHandle;

  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  pub fn try_lock(file: &File, exclusive: bool) -> io::Result<bool> {
    let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
    if exclusive {
      flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }
    // SAFETY: the handle is owned by `file` and outlives the call; a zeroed
    // OVERLAPPED locks from offset 0.
    let locked = unsafe {
      let mut overlapped: OVERLAPPED = std::mem::zeroed();
      LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
    };
    if locked != 0 {
      return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
      Ok(false)
    } else {
      Err(err)
    }
  }
}
