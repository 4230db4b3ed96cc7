// Copyright 2024 the openwrt-imagegen authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-key exclusive filesystem locks.
//!
//! One zero-byte lock file per key lives under the lock directory.  The
//! lock is an advisory whole-file lock, so it is exclusive across processes
//! sharing the cache, not just across threads.  Lock files are never
//! garbage-collected; they are idempotent to recreate.

use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::errors::LockError;

/// Maximum length of the sanitized key in the lock file name.
const MAX_KEY_LEN: usize = 64;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A held per-key lock.  Released on drop, on every exit path.
#[derive(Debug)]
pub struct KeyLock {
    file: File,
    path: PathBuf,
    key: String,
}

/// Reduce an arbitrary key to a filename-safe stem.  Path separators, `:`,
/// and anything else outside `[A-Za-z0-9_.-]` become `_`; the result is
/// truncated to a bounded length.
pub fn sanitize_key(key: &str) -> String {
    let mut out: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_KEY_LEN);
    out
}

impl KeyLock {
    /// Acquire the exclusive lock for `key`, creating the lock file under
    /// `lock_dir` if needed.  With `timeout = None` the call blocks until
    /// the lock is available; otherwise it polls until acquired or the
    /// deadline passes.
    pub fn acquire(
        lock_dir: &Path,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, LockError> {
        create_dir_all(lock_dir).map_err(|err| LockError::Io {
            path: lock_dir.to_path_buf(),
            err,
        })?;
        let path = lock_dir.join(format!("{}.lock", sanitize_key(key)));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|err| LockError::Io {
                path: path.clone(),
                err,
            })?;

        debug!(key, "acquiring lock");
        match timeout {
            None => file.lock_exclusive().map_err(|err| LockError::Io {
                path: path.clone(),
                err,
            })?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            if Instant::now() >= deadline {
                                return Err(LockError::Timeout {
                                    key: key.to_string(),
                                    seconds: timeout.as_secs(),
                                });
                            }
                            sleep(POLL_INTERVAL);
                        }
                        Err(err) => {
                            return Err(LockError::Io {
                                path: path.clone(),
                                err,
                            })
                        }
                    }
                }
            }
        }
        debug!(key, "lock acquired");
        Ok(KeyLock {
            file,
            path,
            key: key.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Closing the descriptor would release the lock anyway; unlocking
        // explicitly keeps the release visible to tooling that inspects
        // lock state.
        let _ = self.file.unlock();
        debug!(key = %self.key, "lock released");
    }
}
