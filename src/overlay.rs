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

//! Overlay staging.
//!
//! Materializes a profile's file overlays into a staging directory that is
//! handed to the Image Builder via `FILES=<dir>`, and computes a
//! deterministic content hash of the staged tree.  `overlay_dir` is staged
//! first; explicit file specs run after it so they override overlay-dir
//! contents deterministically.

use std::fs::{copy, create_dir_all, set_permissions, File, Permissions};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use openssl::sha::Sha256;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::OverlayError;
use crate::io::HASH_CHUNK_SIZE;
use crate::profile::Profile;

type Result<T> = std::result::Result<T, OverlayError>;

/// Parse an octal mode string (`0644` and `644` both accepted).  Invalid
/// strings are logged and ignored, leaving the copied mode in place.
pub fn parse_mode(mode: Option<&str>) -> Option<u32> {
    let mode = mode?;
    match u32::from_str_radix(mode, 8) {
        Ok(bits) => Some(bits),
        Err(_) => {
            warn!(mode, "invalid mode string, ignoring");
            None
        }
    }
}

/// Lexically normalize `candidate` joined under `base` and require the
/// result to stay inside `base`.  Works for paths that do not exist yet.
fn resolve_within(
    base: &Path,
    candidate: &Path,
    what: &'static str,
) -> Result<PathBuf> {
    let joined = base.join(candidate);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.clear();
                }
            }
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(base) {
        return Err(OverlayError::PathTraversal {
            what,
            path: candidate.to_path_buf(),
            base: base.to_path_buf(),
        });
    }
    Ok(normalized)
}

/// Resolve an existing path and require it to stay inside `base`.
/// Symlink-aware: both sides are canonicalized before the containment
/// check.
fn canonicalize_within(
    base: &Path,
    candidate: &Path,
    what: &'static str,
) -> Result<PathBuf> {
    let canonical_base = base.canonicalize().map_err(|err| OverlayError::DirStage {
        dir: base.to_path_buf(),
        err,
    })?;
    let resolved = candidate
        .canonicalize()
        .map_err(|_| OverlayError::SourceNotFound(candidate.to_path_buf()))?;
    if !resolved.starts_with(&canonical_base) {
        return Err(OverlayError::PathTraversal {
            what,
            path: candidate.to_path_buf(),
            base: base.to_path_buf(),
        });
    }
    Ok(resolved)
}

/// Stage a single file, creating parent directories and applying `mode`.
pub fn stage_file(source: &Path, dest: &Path, mode: Option<u32>) -> Result<()> {
    let stage = || -> std::io::Result<()> {
        if let Some(parent) = dest.parent() {
            create_dir_all(parent)?;
        }
        copy(source, dest)?;
        if let Some(bits) = mode {
            set_permissions(dest, Permissions::from_mode(bits))?;
        }
        Ok(())
    };
    stage().map_err(|err| OverlayError::FileStage {
        source: source.to_path_buf(),
        dest: dest.to_path_buf(),
        err,
    })
}

/// Stage an entire directory tree.  Symlinks are not followed during the
/// walk; a link whose target resolves inside the source tree is
/// materialized by copying the target's bytes, and one resolving outside
/// is rejected.
pub fn stage_directory(source_dir: &Path, dest_dir: &Path) -> Result<()> {
    let source_resolved = source_dir
        .canonicalize()
        .map_err(|err| OverlayError::DirStage {
            dir: source_dir.to_path_buf(),
            err,
        })?;

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry.map_err(|e| OverlayError::DirStage {
            dir: source_dir.to_path_buf(),
            err: e.into(),
        })?;
        if entry.path() == source_dir {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .expect("walkdir yields children of its root");
        let dest_path = dest_dir.join(rel);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target =
                entry
                    .path()
                    .canonicalize()
                    .map_err(|err| OverlayError::FileStage {
                        source: entry.path().to_path_buf(),
                        dest: dest_path.clone(),
                        err,
                    })?;
            if !target.starts_with(&source_resolved) {
                return Err(OverlayError::SymlinkEscape {
                    link: entry.path().to_path_buf(),
                    target,
                });
            }
            if target.is_dir() {
                // An in-tree directory link: its contents are reached via
                // their real path on a later walk step.
                continue;
            }
            stage_file(&target, &dest_path, None)?;
        } else if file_type.is_dir() {
            create_dir_all(&dest_path).map_err(|err| OverlayError::DirStage {
                dir: dest_path.clone(),
                err,
            })?;
        } else if file_type.is_file() {
            stage_file(entry.path(), &dest_path, None)?;
        }
    }
    Ok(())
}

/// Stage all overlay content of a profile into `staging_dir`, resolving
/// relative sources against `base_path`.
pub fn stage_overlay(staging_dir: &Path, profile: &Profile, base_path: &Path) -> Result<()> {
    create_dir_all(staging_dir).map_err(|err| OverlayError::DirStage {
        dir: staging_dir.to_path_buf(),
        err,
    })?;

    if let Some(overlay_dir) = &profile.overlay_dir {
        let overlay_path = base_path.join(overlay_dir);
        if !overlay_path.exists() {
            return Err(OverlayError::OverlayNotFound(overlay_path));
        }
        let overlay_path = canonicalize_within(base_path, &overlay_path, "overlay_dir")?;
        if !overlay_path.is_dir() {
            return Err(OverlayError::OverlayNotDir(overlay_path));
        }
        debug!(overlay_dir = %overlay_path.display(), "staging overlay directory");
        stage_directory(&overlay_path, staging_dir)?;
    }

    for spec in &profile.files {
        let source_path = base_path.join(&spec.source);
        if !source_path.exists() {
            return Err(OverlayError::SourceNotFound(source_path));
        }
        let source_path = canonicalize_within(base_path, &source_path, "source")?;

        let dest_rel = spec.destination.trim_start_matches('/');
        let dest_path = resolve_within(staging_dir, Path::new(dest_rel), "destination")?;

        let mode = parse_mode(spec.mode.as_deref());
        debug!(
            source = %source_path.display(),
            dest = %dest_path.display(),
            mode = spec.mode.as_deref().unwrap_or("-"),
            "staging file"
        );
        stage_file(&source_path, &dest_path, mode)?;
    }

    Ok(())
}

/// Deterministic hash of a staged tree: for each regular file in sorted
/// relative-path order, `relpath \0 octal-mode \0 contents \0` is fed to
/// SHA-256.  Directories themselves are not mixed in.  Stable across
/// machines and implementations.
pub fn compute_tree_hash(directory: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    if !directory.exists() {
        return Ok(hex::encode(hasher.finish()));
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(directory).follow_links(false) {
        let entry = entry.map_err(|e| OverlayError::DirStage {
            dir: directory.to_path_buf(),
            err: e.into(),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort_by_key(|p| {
        p.strip_prefix(directory)
            .expect("walkdir yields children of its root")
            .to_path_buf()
    });

    let mut buf = [0u8; HASH_CHUNK_SIZE];
    for path in files {
        let rel = path
            .strip_prefix(directory)
            .expect("walkdir yields children of its root");
        let io_err = |err| OverlayError::FileStage {
            source: path.clone(),
            dest: PathBuf::new(),
            err,
        };
        let mode = path.metadata().map_err(io_err)?.permissions().mode() & 0o777;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{mode:o}").as_bytes());
        hasher.update(b"\0");
        let mut f = File::open(&path).map_err(io_err)?;
        loop {
            let n = f.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        hasher.update(b"\0");
    }

    Ok(hex::encode(hasher.finish()))
}

/// Stage and hash in one step.
pub fn stage_and_hash_overlay(
    staging_dir: &Path,
    profile: &Profile,
    base_path: &Path,
) -> Result<String> {
    stage_overlay(staging_dir, profile, base_path)?;
    compute_tree_hash(staging_dir)
}
