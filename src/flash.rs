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

//! Flash service: composes device validation and the writer, and keeps
//! the flash history.
//!
//! `force` is accepted here purely as an interface convenience for the
//! facades, which use it to refuse unconfirmed real writes; no semantic
//! decision in this module depends on it.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::blockdev::{validate_device, DeviceInfo, ValidateOptions};
use crate::config::Config;
use crate::db::{ArtifactRow, Db, FlashQuery, FlashRecordRow};
use crate::errors::{Error, FlashError, Result, WriteError};
use crate::io::sha256_file;
use crate::types::{VerificationMode, VerificationResult};
use crate::writer::write_image_to_device;

/// Options for one flash invocation.
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    pub wipe_before: bool,
    /// Verification mode; the configured default when unset.
    pub verification_mode: Option<VerificationMode>,
    /// Validate and plan, but do not write and do not record.
    pub dry_run: bool,
    /// Facade-level confirmation gate; carried, never interpreted here.
    pub force: bool,
    pub allow_mounted: bool,
}

/// Everything a flash would do, computed before any byte moves.
#[derive(Debug, Clone)]
pub struct FlashPlan {
    pub image_path: PathBuf,
    pub image_size: u64,
    pub image_hash: String,
    pub device_path: String,
    pub device_info: DeviceInfo,
    pub wipe_before: bool,
    pub verification_mode: VerificationMode,
    pub artifact_id: Option<i64>,
    pub build_id: Option<i64>,
}

/// Outcome of a flash invocation.  Expected failures are reported in-band
/// with `success = false` and the taxonomy kind in `error_kind`.
#[derive(Debug, Clone)]
pub struct FlashResult {
    pub success: bool,
    pub flash_record_id: Option<i64>,
    pub image_path: PathBuf,
    pub device_path: String,
    pub bytes_written: u64,
    pub source_hash: String,
    pub device_hash: Option<String>,
    pub verification_mode: VerificationMode,
    pub verification_result: VerificationResult,
    pub error_kind: Option<&'static str>,
    pub error_message: Option<String>,
}

impl FlashResult {
    fn failure(
        image_path: &Path,
        device_path: &str,
        mode: VerificationMode,
        verification_result: VerificationResult,
        kind: &'static str,
        message: String,
    ) -> Self {
        FlashResult {
            success: false,
            flash_record_id: None,
            image_path: image_path.to_path_buf(),
            device_path: device_path.to_string(),
            bytes_written: 0,
            source_hash: String::new(),
            device_hash: None,
            verification_mode: mode,
            verification_result,
            error_kind: Some(kind),
            error_message: Some(message),
        }
    }
}

/// Validate the inputs of a flash and compute the source hash at the
/// verification granularity.  No side effects.
pub fn plan_flash(
    image_path: &Path,
    device_path: &str,
    wipe_before: bool,
    verification_mode: VerificationMode,
    allow_mounted: bool,
    artifact_id: Option<i64>,
    build_id: Option<i64>,
) -> Result<FlashPlan> {
    if !image_path.exists() {
        return Err(FlashError::from(WriteError::ImageNotFound(image_path.to_path_buf())).into());
    }
    let image_size = image_path
        .metadata()
        .map_err(|e| Error::Internal(anyhow::Error::new(e).context("statting image")))?
        .len();

    let image_hash = if verification_mode == VerificationMode::Skip {
        String::new()
    } else {
        let verify_bytes = verification_mode.verify_bytes(image_size);
        let limit = (verify_bytes < image_size).then_some(verify_bytes);
        sha256_file(image_path, limit)
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("hashing image")))?
            .0
    };

    let device_info = validate_device(
        device_path,
        &ValidateOptions {
            check_mount: true,
            check_system_device: true,
            allow_mounted,
        },
    )
    .map_err(FlashError::from)?;

    Ok(FlashPlan {
        image_path: image_path.to_path_buf(),
        image_size,
        image_hash,
        device_path: device_info.path.clone(),
        device_info,
        wipe_before,
        verification_mode,
        artifact_id,
        build_id,
    })
}

/// Flash an image file to a device, optionally tracking the attempt as a
/// FlashRecord (requires both `artifact_id` and `build_id`).
#[allow(clippy::too_many_arguments)]
pub fn flash_image(
    db: Option<&Db>,
    config: &Config,
    image_path: &Path,
    device_path: &str,
    options: &FlashOptions,
    artifact_id: Option<i64>,
    build_id: Option<i64>,
) -> Result<FlashResult> {
    let verification_mode = options
        .verification_mode
        .unwrap_or(config.verification_mode);
    info!(
        image = %image_path.display(),
        device = %device_path,
        dry_run = options.dry_run,
        force = options.force,
        "flash requested"
    );

    let plan = match plan_flash(
        image_path,
        device_path,
        options.wipe_before,
        verification_mode,
        options.allow_mounted,
        artifact_id,
        build_id,
    ) {
        Ok(plan) => plan,
        Err(e) => match &e {
            // Validation failures are expected outcomes: no record, no
            // side effects, reported in-band.
            Error::Flash(FlashError::Device(_)) | Error::Flash(FlashError::Write(_)) => {
                error!(kind = e.kind(), error = %e, "flash pre-flight failed");
                return Ok(FlashResult::failure(
                    image_path,
                    device_path,
                    verification_mode,
                    VerificationResult::Skipped,
                    e.kind(),
                    e.to_string(),
                ));
            }
            _ => return Err(e),
        },
    };

    if options.dry_run {
        info!("dry run: validation passed, no write performed");
        return Ok(FlashResult {
            success: true,
            flash_record_id: None,
            image_path: plan.image_path,
            device_path: plan.device_path,
            bytes_written: plan.image_size,
            source_hash: plan.image_hash,
            device_hash: None,
            verification_mode: plan.verification_mode,
            verification_result: VerificationResult::Skipped,
            error_kind: None,
            error_message: Some("dry run: no write performed".to_string()),
        });
    }

    let record_id = match (db, artifact_id, build_id) {
        (Some(db), Some(artifact_id), Some(build_id)) => {
            let id = db.insert_flash(
                artifact_id,
                build_id,
                &plan.device_path,
                plan.device_info.model.as_deref(),
                plan.device_info.serial.as_deref(),
                options.wipe_before,
                verification_mode.as_str(),
            )?;
            db.mark_flash_running(id)?;
            Some(id)
        }
        _ => None,
    };

    match write_image_to_device(
        &plan.image_path,
        &plan.device_path,
        options.wipe_before,
        verification_mode,
        Some(&plan.image_hash).filter(|h| !h.is_empty()).map(|h| h.as_str()),
    ) {
        Ok(write) => {
            if let (Some(db), Some(id)) = (db, record_id) {
                db.mark_flash_succeeded(id, write.verification_result)?;
            }
            info!(
                device = %plan.device_path,
                bytes = write.bytes_written,
                verification = %write.verification_result,
                "flash succeeded"
            );
            Ok(FlashResult {
                success: true,
                flash_record_id: record_id,
                image_path: plan.image_path,
                device_path: plan.device_path,
                bytes_written: write.bytes_written,
                source_hash: write.source_hash,
                device_hash: write.device_hash,
                verification_mode,
                verification_result: write.verification_result,
                error_kind: None,
                error_message: None,
            })
        }
        Err(e) => {
            let verification = match &e {
                WriteError::HashMismatch { .. } => Some(VerificationResult::Mismatch),
                _ => None,
            };
            if let (Some(db), Some(id)) = (db, record_id) {
                db.mark_flash_failed(id, e.kind(), &e.to_string(), verification)?;
            }
            error!(kind = e.kind(), error = %e, "flash failed");
            let mut result = FlashResult::failure(
                &plan.image_path,
                &plan.device_path,
                verification_mode,
                verification.unwrap_or(VerificationResult::Skipped),
                e.kind(),
                e.to_string(),
            );
            result.flash_record_id = record_id;
            result.source_hash = plan.image_hash;
            Ok(result)
        }
    }
}

/// Resolve an artifact's on-disk path: the cached absolute path when
/// present, otherwise relative to the artifacts root.
fn artifact_path(artifact: &ArtifactRow, config: &Config) -> PathBuf {
    match &artifact.absolute_path {
        Some(path) => PathBuf::from(path),
        None => config.artifacts_dir.join(&artifact.relative_path),
    }
}

/// Flash a persisted artifact by id.
pub fn flash_artifact(
    db: &Db,
    config: &Config,
    artifact_id: i64,
    device_path: &str,
    options: &FlashOptions,
) -> Result<FlashResult> {
    let artifact = db.get_artifact(artifact_id).map_err(|e| match e {
        crate::errors::StoreError::ArtifactNotFound(id) => {
            Error::from(FlashError::ArtifactNotFound(id))
        }
        other => Error::from(other),
    })?;
    let path = artifact_path(&artifact, config);
    if !path.exists() {
        return Err(FlashError::ArtifactFileNotFound {
            artifact_id,
            path,
        }
        .into());
    }
    flash_image(
        Some(db),
        config,
        &path,
        device_path,
        options,
        Some(artifact.id),
        Some(artifact.build_id),
    )
}

/// Flash history, filtered.
pub fn get_flash_records(db: &Db, query: &FlashQuery) -> Result<Vec<FlashRecordRow>> {
    Ok(db.list_flash_records(query)?)
}
