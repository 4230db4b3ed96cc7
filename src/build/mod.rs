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

//! Build orchestration: the build-or-reuse pipeline.
//!
//! Composes overlay staging, cache key computation, per-key locking, the
//! external runner, and artifact discovery into one idempotent operation.
//! At most one invocation per cache key runs the external builder; the
//! re-check after lock acquisition is what makes the losers observe the
//! winner's SUCCEEDED record.

pub mod artifacts;
pub mod runner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::cachekey::compute_cache_key_from_profile;
use crate::config::Config;
use crate::db::{ArtifactRow, BuildRecordRow, Db, ImageBuilderRow, ProfileRow};
use crate::errors::{Error, Result, RunnerError};
use crate::lock::KeyLock;
use crate::overlay::stage_and_hash_overlay;
use crate::profile::{query_profiles, ProfileQuery};
use crate::types::BuildStatus;

use self::artifacts::{discover_artifacts, generate_manifest, write_manifest, ManifestContext};
use self::runner::{run_build, validate_imagebuilder_root, RunOptions};

/// How long a pipeline waits for the per-cache-key lock.
const BUILD_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Build-time options for one pipeline invocation.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Skip the cache lookup and always run the builder.
    pub force_rebuild: bool,
    /// Additional packages merged into the effective list.
    pub extra_packages: Vec<String>,
    /// Override for EXTRA_IMAGE_NAME.
    pub extra_image_name: Option<String>,
    /// Extra build-time options; part of the cache key.
    pub build_options: BTreeMap<String, Value>,
    /// Base for resolving relative overlay sources; cwd when unset.
    pub base_path: Option<PathBuf>,
}

/// Build an image, or reuse the existing successful build with the same
/// cache key.  Returns the record and whether it was a cache hit.
pub fn build_or_reuse(
    db: &Db,
    config: &Config,
    profile_row: &ProfileRow,
    imagebuilder: &ImageBuilderRow,
    options: &BuildOptions,
) -> Result<(BuildRecordRow, bool)> {
    let profile = &profile_row.profile;

    let ib_root = PathBuf::from(&imagebuilder.root_dir);
    if !validate_imagebuilder_root(&ib_root) {
        return Err(RunnerError::InvalidImageBuilder(ib_root).into());
    }

    let base_path = match &options.base_path {
        Some(p) => p.clone(),
        None => std::env::current_dir()
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("getting cwd")))?,
    };

    // The staging directory lives for the whole pipeline and is removed on
    // every exit path when this binding drops.
    let mut staging: Option<tempfile::TempDir> = None;
    let mut overlay_hash: Option<String> = None;
    if profile.has_overlay_content() {
        let dir = tempfile::Builder::new()
            .prefix("owrt_overlay_")
            .tempdir_in(config.scratch_dir())
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("creating staging dir")))?;
        let hash = stage_and_hash_overlay(dir.path(), profile, &base_path)?;
        info!(staging = %dir.path().display(), hash = %&hash[..16], "staged overlay");
        overlay_hash = Some(hash);
        staging = Some(dir);
    }

    let (cache_key, build_inputs) = compute_cache_key_from_profile(
        profile,
        overlay_hash,
        &options.extra_packages,
        &options.build_options,
    );
    info!(cache_key = %cache_key, "computed cache key");

    let _lock = KeyLock::acquire(
        &config.lock_dir(),
        &format!("build_{cache_key}"),
        Some(BUILD_LOCK_TIMEOUT),
    )?;

    // Re-check under the lock; a concurrent pipeline with the same key may
    // have completed while we waited.
    if !options.force_rebuild {
        if let Some(cached) = db.find_succeeded_build(&cache_key)? {
            info!(build_id = cached.id, "cache hit, reusing build");
            db.touch_builder(imagebuilder.id)?;
            return Ok((cached, true));
        }
    }

    let snapshot = build_inputs.to_value();
    let build_id = db.insert_build(profile_row.id, imagebuilder.id, &cache_key, &snapshot)?;
    info!(build_id, "created build record");

    let build_dir = config
        .artifacts_dir
        .join(&profile.openwrt_release)
        .join(&profile.target)
        .join(&profile.subtarget)
        .join(&profile.profile_id)
        .join(format!(
            "{build_id:08}_{}",
            &Uuid::new_v4().simple().to_string()[..8]
        ));
    std::fs::create_dir_all(&build_dir)
        .map_err(|e| Error::Internal(anyhow::Error::new(e).context("creating build dir")))?;
    db.mark_build_running(build_id, &build_dir.to_string_lossy())?;

    let run_options = RunOptions {
        files_dir: staging.as_ref().map(|d| d.path().to_path_buf()),
        extra_packages: options.extra_packages.clone(),
        extra_image_name: options.extra_image_name.clone(),
        timeout: Some(config.build_timeout_duration()),
        make_program: Some(config.make_program.clone()),
        env: Vec::new(),
    };

    let run = match run_build(profile, &ib_root, &build_dir, &run_options) {
        Ok(run) => run,
        Err(e) => {
            db.mark_build_failed(build_id, e.kind(), &e.to_string())?;
            if let Some(log_path) = e.log_path() {
                db.set_build_log_path(build_id, &log_path.to_string_lossy())?;
            }
            return Err(e.into());
        }
    };
    db.set_build_log_path(build_id, &run.log_path.to_string_lossy())?;

    if !run.success {
        let err = RunnerError::BuildFailed {
            exit_code: run.exit_code,
            log_path: Some(run.log_path.clone()),
        };
        db.mark_build_failed(build_id, err.kind(), &err.to_string())?;
        error!(build_id, exit_code = run.exit_code, "build failed");
        return Err(err.into());
    }

    let finish = || -> Result<()> {
        let discovered =
            discover_artifacts(&run.bin_dir, Some(&config.artifacts_dir), false)?;
        let manifest = generate_manifest(
            &discovered,
            &ManifestContext {
                build_id: Some(build_id),
                cache_key: Some(cache_key.clone()),
                profile_id: Some(profile.profile_id.clone()),
                build_inputs: Some(snapshot.clone()),
                metadata: None,
            },
        );
        write_manifest(&manifest, &build_dir.join("manifest.json"))?;
        for info in &discovered {
            let absolute = run.bin_dir.join(&info.filename);
            let absolute = absolute.exists().then(|| absolute.to_string_lossy().into_owned());
            db.insert_artifact(build_id, info, absolute.as_deref())?;
        }
        db.mark_build_succeeded(build_id)?;
        db.touch_builder(imagebuilder.id)?;
        info!(build_id, artifacts = discovered.len(), "build succeeded");
        Ok(())
    };
    if let Err(e) = finish() {
        db.mark_build_failed(build_id, e.kind(), &e.to_string())?;
        return Err(e);
    }

    Ok((db.get_build(build_id)?, false))
}

/// Batch failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    FailFast,
    BestEffort,
}

impl FromStr for BatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail-fast" => Ok(BatchMode::FailFast),
            "best-effort" => Ok(BatchMode::BestEffort),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Per-profile outcome within a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub profile_id: String,
    pub build_id: Option<i64>,
    pub cache_hit: bool,
    pub success: bool,
    pub error_kind: Option<&'static str>,
    pub error_message: Option<String>,
}

/// Summary of a batch run.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub stopped_early: bool,
    pub results: Vec<BatchItem>,
}

/// Build every profile matching `query`.  `FailFast` stops at the first
/// failure; `BestEffort` records it and keeps going.
pub fn build_batch(
    db: &Db,
    config: &Config,
    query: &ProfileQuery,
    mode: BatchMode,
    force_rebuild: bool,
) -> Result<BatchSummary> {
    let profiles = query_profiles(db, query)?;
    let total = profiles.len();
    let mut summary = BatchSummary {
        total,
        succeeded: 0,
        failed: 0,
        cache_hits: 0,
        stopped_early: false,
        results: Vec::with_capacity(total),
    };

    for (index, profile_row) in profiles.iter().enumerate() {
        let profile = &profile_row.profile;
        let outcome = crate::imagebuilder::ensure_builder(
            db,
            config,
            &profile.openwrt_release,
            &profile.target,
            &profile.subtarget,
            false,
        )
        .and_then(|builder| {
            build_or_reuse(
                db,
                config,
                profile_row,
                &builder,
                &BuildOptions {
                    force_rebuild,
                    ..Default::default()
                },
            )
        });

        match outcome {
            Ok((record, cache_hit)) => {
                summary.succeeded += 1;
                if cache_hit {
                    summary.cache_hits += 1;
                }
                summary.results.push(BatchItem {
                    profile_id: profile.profile_id.clone(),
                    build_id: Some(record.id),
                    cache_hit,
                    success: true,
                    error_kind: None,
                    error_message: None,
                });
            }
            Err(e) => {
                summary.failed += 1;
                summary.results.push(BatchItem {
                    profile_id: profile.profile_id.clone(),
                    build_id: None,
                    cache_hit: false,
                    success: false,
                    error_kind: Some(e.kind()),
                    error_message: Some(e.to_string()),
                });
                if mode == BatchMode::FailFast {
                    summary.stopped_early = index + 1 < total;
                    break;
                }
            }
        }
    }
    Ok(summary)
}

/// Fetch one build record, failing with `build_not_found`.
pub fn get_build(db: &Db, build_id: i64) -> Result<BuildRecordRow> {
    Ok(db.get_build(build_id)?)
}

/// List build records, newest first.
pub fn list_builds(
    db: &Db,
    profile_row_id: Option<i64>,
    status: Option<BuildStatus>,
    limit: u32,
) -> Result<Vec<BuildRecordRow>> {
    Ok(db.list_builds(profile_row_id, status, limit)?)
}

/// Artifacts of one build, failing with `build_not_found` for an unknown
/// build.
pub fn get_build_artifacts(db: &Db, build_id: i64) -> Result<Vec<ArtifactRow>> {
    db.get_build(build_id)?;
    Ok(db.artifacts_for_build(build_id)?)
}
