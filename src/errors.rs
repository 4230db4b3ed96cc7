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

//! Error taxonomy.
//!
//! Every error carries a stable machine-readable kind string that crosses
//! component and facade boundaries unchanged.  The kinds are a flat set;
//! facades serialize `{kind, message}` pairs and must never depend on the
//! concrete Rust types here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Overlay staging failures (C2).
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay directory not found: {0}")]
    OverlayNotFound(PathBuf),
    #[error("overlay path is not a directory: {0}")]
    OverlayNotDir(PathBuf),
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("symlink {link} points outside source tree: {target}")]
    SymlinkEscape { link: PathBuf, target: PathBuf },
    #[error("{what} path traversal detected: {path} resolves outside {base}")]
    PathTraversal {
        what: &'static str,
        path: PathBuf,
        base: PathBuf,
    },
    #[error("staging file {source} -> {dest}")]
    FileStage {
        source: PathBuf,
        dest: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("staging directory tree {dir}")]
    DirStage {
        dir: PathBuf,
        #[source]
        err: io::Error,
    },
}

impl OverlayError {
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayError::OverlayNotFound(_) => "overlay_not_found",
            OverlayError::OverlayNotDir(_) => "overlay_not_dir",
            OverlayError::SourceNotFound(_) => "source_not_found",
            OverlayError::SymlinkEscape { .. } => "symlink_escape",
            OverlayError::PathTraversal { .. } => "path_traversal",
            OverlayError::FileStage { .. } => "file_stage_error",
            OverlayError::DirStage { .. } => "dir_stage_error",
        }
    }
}

/// Download and extraction failures (C4).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error fetching {url}: {status}")]
    Http { url: String, status: u16 },
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("network error fetching {url}")]
    Network {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("refusing to extract {member}: path traversal detected")]
    PathTraversal { member: String },
    #[error("extracting {archive}")]
    Tar {
        archive: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("{0}")]
    Path(String),
    #[error("{context}")]
    Os {
        context: String,
        #[source]
        err: io::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http { .. } => "http_error",
            FetchError::Timeout { .. } => "timeout",
            FetchError::Network { .. } => "network_error",
            FetchError::ChecksumMismatch { .. } => "verification_error",
            FetchError::UnsupportedFormat(_) => "unsupported_format",
            FetchError::PathTraversal { .. } => "path_traversal",
            FetchError::Tar { .. } => "tar_error",
            FetchError::Path(_) => "path_error",
            FetchError::Os { .. } => "os_error",
        }
    }
}

/// Image Builder cache failures (C4 state machine).
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Image Builder is broken: {release}/{target}/{subtarget}")]
    Broken {
        release: String,
        target: String,
        subtarget: String,
    },
    #[error("Image Builder not found: {release}/{target}/{subtarget}")]
    NotFound {
        release: String,
        target: String,
        subtarget: String,
    },
    #[error("cannot download Image Builder {release}/{target}/{subtarget} in offline mode")]
    Offline {
        release: String,
        target: String,
        subtarget: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl BuilderError {
    pub fn kind(&self) -> &'static str {
        match self {
            BuilderError::Broken { .. } => "imagebuilder_broken",
            BuilderError::NotFound { .. } => "imagebuilder_not_found",
            BuilderError::Offline { .. } => "offline_mode",
            BuilderError::Fetch(e) => e.kind(),
        }
    }
}

/// Build execution failures (C5).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("build failed with exit code {exit_code}")]
    BuildFailed {
        exit_code: i32,
        log_path: Option<PathBuf>,
    },
    #[error("build timed out after {seconds} seconds")]
    BuildTimeout {
        seconds: u64,
        log_path: Option<PathBuf>,
    },
    #[error("failed to execute build")]
    Execution(#[source] io::Error),
    #[error("invalid Image Builder root: {0}")]
    InvalidImageBuilder(PathBuf),
    #[error("make info failed with exit code {exit_code}: {stderr}")]
    MakeInfo { exit_code: i32, stderr: String },
    #[error("make info timed out after {seconds} seconds")]
    InfoTimeout { seconds: u64 },
}

impl RunnerError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::BuildFailed { .. } => "build_error",
            RunnerError::BuildTimeout { .. } => "build_timeout",
            RunnerError::Execution(_) => "execution_error",
            RunnerError::InvalidImageBuilder(_) => "invalid_imagebuilder",
            RunnerError::MakeInfo { .. } => "make_info_error",
            RunnerError::InfoTimeout { .. } => "timeout",
        }
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            RunnerError::BuildFailed { log_path, .. }
            | RunnerError::BuildTimeout { log_path, .. } => log_path.as_ref(),
            _ => None,
        }
    }
}

/// Device validation failures (C8).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("not a block device: {0}")]
    NotBlockDevice(String),
    #[error(
        "device appears to be a partition, not a whole device: {0}. \
         Only whole devices (e.g. /dev/sda, /dev/mmcblk0) are supported"
    )]
    Partition(String),
    #[error("device {0} appears to be the system root device; refusing to flash")]
    SystemDevice(String),
    #[error("device {device} has mounted partitions: {}", mount_points.join(", "))]
    Mounted {
        device: String,
        mount_points: Vec<String>,
    },
}

impl DeviceError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::NotFound(_) => "DEVICE_NOT_FOUND",
            DeviceError::NotBlockDevice(_) => "NOT_BLOCK_DEVICE",
            DeviceError::Partition(_) => "PARTITION_NOT_ALLOWED",
            DeviceError::SystemDevice(_) => "SYSTEM_DEVICE",
            DeviceError::Mounted { .. } => "DEVICE_MOUNTED",
        }
    }
}

/// Write and verification failures (C9).
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("image file not found: {0}")]
    ImageNotFound(PathBuf),
    #[error("permission denied writing to device {device}")]
    PermissionDenied {
        device: String,
        #[source]
        err: io::Error,
    },
    #[error("I/O error on device {device}")]
    Io {
        device: String,
        #[source]
        err: io::Error,
    },
    #[error(
        "hash verification failed for {device}: expected {expected}, got {actual} \
         (mode: {mode}). The card may be defective or a ghost write occurred"
    )]
    HashMismatch {
        device: String,
        expected: String,
        actual: String,
        mode: String,
    },
}

impl WriteError {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteError::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            WriteError::PermissionDenied { .. } => "WRITE_PERMISSION_DENIED",
            WriteError::Io { .. } => "WRITE_IO_ERROR",
            WriteError::HashMismatch { .. } => "HASH_MISMATCH",
        }
    }
}

/// Flash service failures (C10).
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("artifact not found: {0}")]
    ArtifactNotFound(i64),
    #[error("artifact file not found on disk: {path} (artifact_id={artifact_id})")]
    ArtifactFileNotFound { artifact_id: i64, path: PathBuf },
    #[error("flash operation aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl FlashError {
    pub fn kind(&self) -> &'static str {
        match self {
            FlashError::ArtifactNotFound(_) => "ARTIFACT_NOT_FOUND",
            FlashError::ArtifactFileNotFound { .. } => "ARTIFACT_FILE_NOT_FOUND",
            FlashError::Aborted(_) => "FLASH_ABORTED",
            FlashError::Device(e) => e.kind(),
            FlashError::Write(e) => e.kind(),
        }
    }
}

/// Per-key lock failures (C3).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timeout waiting for lock on {key} after {seconds} seconds")]
    Timeout { key: String, seconds: u64 },
    #[error("lock file {path}")]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
}

impl LockError {
    pub fn kind(&self) -> &'static str {
        match self {
            LockError::Timeout { .. } => "timeout",
            LockError::Io { .. } => "os_error",
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("profile already exists: {0}")]
    ProfileExists(String),
    #[error("profile_id mismatch: expected {expected}, got {got}")]
    ProfileIdMismatch { expected: String, got: String },
    #[error("build not found: {0}")]
    BuildNotFound(i64),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(i64),
    #[error("record {id} is {status} and cannot transition")]
    InvalidTransition { id: i64, status: &'static str },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::ProfileNotFound(_) => "profile_not_found",
            StoreError::ProfileExists(_) => "profile_exists",
            StoreError::ProfileIdMismatch { .. } => "profile_id_mismatch",
            StoreError::BuildNotFound(_) => "build_not_found",
            StoreError::ArtifactNotFound(_) => "artifact_not_found",
            StoreError::InvalidTransition { .. } => "invalid_state",
            StoreError::Sqlite(_) | StoreError::Encoding(_) => "internal_error",
        }
    }
}

/// Top-level error surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no selection filter supplied")]
    NoFilter,
    #[error("cache conflict for key: {cache_key}")]
    CacheConflict { cache_key: String },
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable taxonomy identifier for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::InvalidMode(_) => "invalid_mode",
            Error::InvalidStatus(_) => "invalid_status",
            Error::InvalidState(_) => "invalid_state",
            Error::NoFilter => "no_filter",
            Error::CacheConflict { .. } => "cache_conflict",
            Error::Overlay(e) => e.kind(),
            Error::Builder(e) => e.kind(),
            Error::Runner(e) => e.kind(),
            Error::Device(e) => e.kind(),
            Error::Write(e) => e.kind(),
            Error::Flash(e) => e.kind(),
            Error::Lock(e) => e.kind(),
            Error::Store(e) => e.kind(),
            Error::Internal(_) => "internal_error",
        }
    }

    /// Build log path, when the failure produced one.
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Error::Runner(e) => e.log_path(),
            _ => None,
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        Error::Builder(BuilderError::Fetch(e))
    }
}
