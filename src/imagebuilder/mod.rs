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

//! Image Builder cache management.
//!
//! One row per (release, target, subtarget) triple.  `ensure_builder` is
//! the single-flight entry point: concurrent callers for the same triple
//! serialize on a per-key filesystem lock, and only the first one
//! downloads; the rest observe READY on re-check.

pub mod fetch;

use std::path::Path;
use std::time::Duration;

use byte_unit::Byte;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{Db, ImageBuilderRow};
use crate::errors::{BuilderError, Error, FetchError, Result};
use crate::lock::KeyLock;
use crate::types::ImageBuilderState;

/// How long `ensure_builder` waits for the per-triple download lock.
const ENSURE_LOCK_TIMEOUT: Duration = Duration::from_secs(3900);

fn lock_key(release: &str, target: &str, subtarget: &str) -> String {
    format!("{release}_{target}_{subtarget}")
}

/// A READY row whose root still exists on disk.
fn usable(row: &ImageBuilderRow) -> bool {
    row.state == ImageBuilderState::Ready
        && !row.root_dir.is_empty()
        && Path::new(&row.root_dir).exists()
}

/// Ensure an Image Builder is READY for the given triple, downloading and
/// extracting it if needed.  With `force` a BROKEN builder is retried and
/// a READY one re-downloaded.
pub fn ensure_builder(
    db: &Db,
    config: &Config,
    release: &str,
    target: &str,
    subtarget: &str,
    force: bool,
) -> Result<ImageBuilderRow> {
    let existing = db.get_builder(release, target, subtarget)?;

    if let Some(row) = &existing {
        if !force {
            match row.state {
                ImageBuilderState::Ready => {
                    if usable(row) {
                        info!(release, target, subtarget, "using cached Image Builder");
                        db.touch_builder(row.id)?;
                        return db
                            .get_builder_by_id(row.id)?
                            .ok_or_else(|| not_found(release, target, subtarget));
                    }
                    // Directory was deleted externally.
                    warn!(
                        root_dir = %row.root_dir,
                        "Image Builder directory missing, marking broken"
                    );
                    db.set_builder_state(row.id, ImageBuilderState::Broken)?;
                }
                ImageBuilderState::Broken => {
                    return Err(BuilderError::Broken {
                        release: release.to_string(),
                        target: target.to_string(),
                        subtarget: subtarget.to_string(),
                    }
                    .into());
                }
                ImageBuilderState::Deprecated => {
                    info!(release, target, subtarget, "replacing deprecated Image Builder");
                }
                ImageBuilderState::Pending => {}
            }
        }
    }

    // From here on a download is required.
    if config.offline {
        return Err(BuilderError::Offline {
            release: release.to_string(),
            target: target.to_string(),
            subtarget: subtarget.to_string(),
        }
        .into());
    }

    let _lock = KeyLock::acquire(
        &config.lock_dir(),
        &lock_key(release, target, subtarget),
        Some(ENSURE_LOCK_TIMEOUT),
    )?;

    // Re-check under the lock: another process may have raced to READY.
    let row = db.get_builder(release, target, subtarget)?;
    if !force {
        if let Some(row) = &row {
            if usable(row) {
                info!(
                    release,
                    target, subtarget, "Image Builder became available while waiting for lock"
                );
                db.touch_builder(row.id)?;
                return db
                    .get_builder_by_id(row.id)?
                    .ok_or_else(|| not_found(release, target, subtarget));
            }
        }
    }

    let urls = fetch::imagebuilder_urls(release, target, subtarget, &config.download_base_url);
    let builder_id = match row {
        Some(row) => {
            db.set_builder_state(row.id, ImageBuilderState::Pending)?;
            row.id
        }
        None => db.insert_builder(release, target, subtarget, &urls.archive_url)?,
    };

    let client = Client::builder()
        .build()
        .map_err(|e| Error::from(FetchError::Network {
            url: urls.archive_url.clone(),
            err: e,
        }))?;

    match fetch::download_imagebuilder(
        &client,
        release,
        target,
        subtarget,
        &config.cache_dir,
        &config.download_base_url,
        config.download_timeout_duration(),
    ) {
        Ok((root_dir, checksum)) => {
            db.set_builder_ready(builder_id, &root_dir.to_string_lossy(), Some(&checksum))?;
            info!(release, target, subtarget, root = %root_dir.display(), "Image Builder ready");
            db.get_builder_by_id(builder_id)?
                .ok_or_else(|| not_found(release, target, subtarget))
        }
        Err(e) => {
            db.set_builder_state(builder_id, ImageBuilderState::Broken)?;
            warn!(release, target, subtarget, error = %e, "Image Builder download failed");
            Err(e.into())
        }
    }
}

fn not_found(release: &str, target: &str, subtarget: &str) -> Error {
    BuilderError::NotFound {
        release: release.to_string(),
        target: target.to_string(),
        subtarget: subtarget.to_string(),
    }
    .into()
}

/// Look up one builder row, failing with `imagebuilder_not_found`.
pub fn get_builder(
    db: &Db,
    release: &str,
    target: &str,
    subtarget: &str,
) -> Result<ImageBuilderRow> {
    db.get_builder(release, target, subtarget)?
        .ok_or_else(|| not_found(release, target, subtarget))
}

/// List builder rows with optional filters on each key column and state.
pub fn list_builders(
    db: &Db,
    release: Option<&str>,
    target: Option<&str>,
    subtarget: Option<&str>,
    state: Option<ImageBuilderState>,
) -> Result<Vec<ImageBuilderRow>> {
    Ok(db.list_builders(release, target, subtarget, state)?)
}

/// Prune cached builders.  `deprecated_only` removes DEPRECATED rows;
/// `unused_days` removes rows not used for N days (or never).  The two
/// selection modes are mutually exclusive.
pub fn prune_builders(
    db: &Db,
    config: &Config,
    deprecated_only: bool,
    unused_days: Option<i64>,
    dry_run: bool,
) -> Result<Vec<(String, String, String)>> {
    let candidates = match (deprecated_only, unused_days) {
        (true, Some(_)) => {
            return Err(Error::Validation(
                "deprecated_only and unused_days are mutually exclusive".to_string(),
            ))
        }
        (true, None) => db.list_builders(None, None, None, Some(ImageBuilderState::Deprecated))?,
        (false, Some(days)) => {
            let cutoff = Utc::now() - ChronoDuration::days(days);
            db.builders_last_used_before(cutoff)?
        }
        (false, None) => return Err(Error::NoFilter),
    };

    let mut pruned = Vec::new();
    for row in candidates {
        let key = (
            row.openwrt_release.clone(),
            row.target.clone(),
            row.subtarget.clone(),
        );
        if dry_run {
            info!(
                release = %key.0,
                target = %key.1,
                subtarget = %key.2,
                "would prune Image Builder (dry run)"
            );
            pruned.push(key);
            continue;
        }

        let builder_dir = config
            .cache_dir
            .join(&row.openwrt_release)
            .join(&row.target)
            .join(&row.subtarget);
        if let Err(e) = fetch::prune_builder_dir(&builder_dir) {
            warn!(dir = %builder_dir.display(), error = %e, "failed to prune builder directory");
            continue;
        }
        db.delete_builder(row.id)?;
        info!(release = %key.0, target = %key.1, subtarget = %key.2, "pruned Image Builder");
        pruned.push(key);
    }
    Ok(pruned)
}

/// Summary of the on-disk cache tree.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_dir: String,
    pub total_size_bytes: u64,
    pub total_size_human: String,
    pub exists: bool,
}

pub fn builder_cache_info(config: &Config) -> CacheInfo {
    let total = fetch::cache_size(&config.cache_dir);
    CacheInfo {
        cache_dir: config.cache_dir.display().to_string(),
        total_size_bytes: total,
        total_size_human: Byte::from_bytes(total as u128)
            .get_appropriate_unit(true)
            .format(1),
        exists: config.cache_dir.exists(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};
    use tempfile::TempDir;

    fn test_config(root: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.cache_dir = root.join("cache");
        cfg.artifacts_dir = root.join("artifacts");
        cfg.offline = true;
        cfg
    }

    fn seed_ready_builder(db: &Db, cfg: &Config) -> ImageBuilderRow {
        let root = cfg.cache_dir.join("23.05.3/ath79/generic/openwrt-ib");
        create_dir_all(&root).unwrap();
        write(root.join("Makefile"), b"all:").unwrap();
        let id = db
            .insert_builder("23.05.3", "ath79", "generic", "https://example/a.tar.xz")
            .unwrap();
        db.set_builder_ready(id, &root.to_string_lossy(), Some("cafe"))
            .unwrap();
        db.get_builder_by_id(id).unwrap().unwrap()
    }

    #[test]
    fn test_ensure_returns_ready_row_without_download() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let seeded = seed_ready_builder(&db, &cfg);

        // offline is on: any download attempt would fail, so success proves
        // the cached row was used
        let row = ensure_builder(&db, &cfg, "23.05.3", "ath79", "generic", false).unwrap();
        assert_eq!(row.id, seeded.id);
        assert_eq!(row.state, ImageBuilderState::Ready);
        assert!(row.last_used_at.is_some());
    }

    #[test]
    fn test_ensure_missing_root_marks_broken_then_offline_error() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let seeded = seed_ready_builder(&db, &cfg);
        std::fs::remove_dir_all(&seeded.root_dir).unwrap();

        let err = ensure_builder(&db, &cfg, "23.05.3", "ath79", "generic", false).unwrap_err();
        assert_eq!(err.kind(), "offline_mode");
        let row = db.get_builder_by_id(seeded.id).unwrap().unwrap();
        assert_eq!(row.state, ImageBuilderState::Broken);
    }

    #[test]
    fn test_ensure_broken_fails_without_force() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let id = db
            .insert_builder("23.05.3", "ath79", "generic", "https://example/a.tar.xz")
            .unwrap();
        db.set_builder_state(id, ImageBuilderState::Broken).unwrap();

        let err = ensure_builder(&db, &cfg, "23.05.3", "ath79", "generic", false).unwrap_err();
        assert_eq!(err.kind(), "imagebuilder_broken");

        // force retries, which in offline mode surfaces offline_mode
        let err = ensure_builder(&db, &cfg, "23.05.3", "ath79", "generic", true).unwrap_err();
        assert_eq!(err.kind(), "offline_mode");
    }

    #[test]
    fn test_ensure_offline_refuses_fresh_download() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let err = ensure_builder(&db, &cfg, "23.05.3", "ath79", "generic", false).unwrap_err();
        assert_eq!(err.kind(), "offline_mode");
    }

    #[test]
    fn test_get_builder_not_found() {
        let db = Db::open_in_memory().unwrap();
        let err = get_builder(&db, "23.05.3", "ath79", "generic").unwrap_err();
        assert_eq!(err.kind(), "imagebuilder_not_found");
    }

    #[test]
    fn test_prune_mutually_exclusive_filters() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let err = prune_builders(&db, &cfg, true, Some(30), false).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = prune_builders(&db, &cfg, false, None, false).unwrap_err();
        assert_eq!(err.kind(), "no_filter");
    }

    #[test]
    fn test_prune_deprecated_removes_rows_and_dirs() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        let seeded = seed_ready_builder(&db, &cfg);
        db.set_builder_state(seeded.id, ImageBuilderState::Deprecated)
            .unwrap();
        let builder_dir = cfg.cache_dir.join("23.05.3/ath79/generic");
        assert!(builder_dir.exists());

        // dry run touches nothing
        let listed = prune_builders(&db, &cfg, true, None, true).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(builder_dir.exists());
        assert!(db.get_builder_by_id(seeded.id).unwrap().is_some());

        let pruned = prune_builders(&db, &cfg, true, None, false).unwrap();
        assert_eq!(
            pruned,
            vec![(
                "23.05.3".to_string(),
                "ath79".to_string(),
                "generic".to_string()
            )]
        );
        assert!(!builder_dir.exists());
        assert!(db.get_builder_by_id(seeded.id).unwrap().is_none());
    }

    #[test]
    fn test_prune_unused_days() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let db = Db::open_in_memory().unwrap();
        // never used: last_used_at is NULL and qualifies
        db.insert_builder("22.03.5", "ramips", "mt7621", "https://example/b.tar.xz")
            .unwrap();
        let pruned = prune_builders(&db, &cfg, false, Some(30), false).unwrap();
        assert_eq!(pruned.len(), 1);

        // freshly used: does not qualify
        let seeded = seed_ready_builder(&db, &cfg);
        db.touch_builder(seeded.id).unwrap();
        let pruned = prune_builders(&db, &cfg, false, Some(30), false).unwrap();
        assert!(pruned.is_empty());
    }

    #[test]
    fn test_cache_info() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let info = builder_cache_info(&cfg);
        assert!(!info.exists);
        assert_eq!(info.total_size_bytes, 0);

        create_dir_all(&cfg.cache_dir).unwrap();
        write(cfg.cache_dir.join("blob"), vec![0u8; 2048]).unwrap();
        let info = builder_cache_info(&cfg);
        assert!(info.exists);
        assert_eq!(info.total_size_bytes, 2048);
        assert!(info.total_size_human.contains("KiB"));
    }
}
