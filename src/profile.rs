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

//! The declarative build recipe for one device, plus CRUD over the store.
//!
//! Profiles are immutable from the build pipeline's point of view: the
//! pipeline snapshots the build-affecting fields into the cache key and
//! never writes a profile back.

use std::fs::remove_dir_all;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::{Db, ProfileRow};
use crate::errors::{Error, Result};

lazy_static! {
    static ref PROFILE_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
}

/// One file to layer into the image at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path on the host, resolved against the profile base directory.
    pub source: String,
    /// Path inside the image filesystem; must begin with `/`.
    pub destination: String,
    /// Octal mode string, e.g. `0644` or `644`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// `user:group` ownership, e.g. `root:root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Build policies of a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePolicies {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_kernel_symbols: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_resize_rootfs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_snapshot: Option<bool>,
}

/// A declarative, immutable recipe for one device's image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable identifier, `[A-Za-z0-9_.-]+`.
    pub profile_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// OpenWrt release version, e.g. `23.05.3`, or `snapshot`.
    pub openwrt_release: String,
    pub target: String,
    pub subtarget: String,
    /// Image Builder PROFILE name, e.g. `tplink_archer-c7-v2`.
    pub imagebuilder_profile: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages_remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<ProfilePolicies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_services: Vec<String>,
    /// Root filesystem partition size in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_partsize: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_local_key: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Profile {
    /// Minimal profile with only the required fields set.
    pub fn new(
        profile_id: &str,
        device_id: &str,
        openwrt_release: &str,
        target: &str,
        subtarget: &str,
        imagebuilder_profile: &str,
    ) -> Self {
        Profile {
            profile_id: profile_id.to_string(),
            name: profile_id.to_string(),
            description: None,
            device_id: device_id.to_string(),
            tags: Vec::new(),
            openwrt_release: openwrt_release.to_string(),
            target: target.to_string(),
            subtarget: subtarget.to_string(),
            imagebuilder_profile: imagebuilder_profile.to_string(),
            packages: Vec::new(),
            packages_remove: Vec::new(),
            files: Vec::new(),
            overlay_dir: None,
            policies: None,
            bin_dir: None,
            extra_image_name: None,
            disabled_services: Vec::new(),
            rootfs_partsize: None,
            add_local_key: None,
            notes: None,
        }
    }

    /// Whether this profile has any overlay content to stage.
    pub fn has_overlay_content(&self) -> bool {
        !self.files.is_empty() || self.overlay_dir.is_some()
    }

    /// Check the structural invariants of the data model.
    pub fn validate(&self) -> Result<()> {
        if !PROFILE_ID_PATTERN.is_match(&self.profile_id) {
            return Err(Error::Validation(format!(
                "profile_id must match [A-Za-z0-9_.-]+, got {:?}",
                self.profile_id
            )));
        }
        for field in [
            ("openwrt_release", &self.openwrt_release),
            ("target", &self.target),
            ("subtarget", &self.subtarget),
            ("imagebuilder_profile", &self.imagebuilder_profile),
        ] {
            if field.1.is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", field.0)));
            }
        }
        for spec in &self.files {
            if !spec.destination.starts_with('/') {
                return Err(Error::Validation(format!(
                    "file destination must start with '/', got {:?}",
                    spec.destination
                )));
            }
            if let Some(mode) = &spec.mode {
                if u32::from_str_radix(mode, 8).is_err() {
                    return Err(Error::Validation(format!(
                        "file mode must be an octal string, got {mode:?}"
                    )));
                }
            }
        }
        if let Some(size) = self.rootfs_partsize {
            if size == 0 {
                return Err(Error::Validation(
                    "rootfs_partsize must be a positive integer".to_string(),
                ));
            }
        }
        if let Some(policies) = &self.policies {
            if let Some(fs) = &policies.filesystem {
                if fs != "squashfs" && fs != "ext4" {
                    return Err(Error::Validation(format!(
                        "policies.filesystem must be squashfs or ext4, got {fs:?}"
                    )));
                }
            }
        }
        if self.openwrt_release == "snapshot" {
            let allowed = self
                .policies
                .as_ref()
                .and_then(|p| p.allow_snapshot)
                .unwrap_or(false);
            if !allowed {
                return Err(Error::Validation(
                    "snapshot release requires policies.allow_snapshot".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Filters for [`query_profiles`].
#[derive(Debug, Clone, Default)]
pub struct ProfileQuery {
    pub openwrt_release: Option<String>,
    pub target: Option<String>,
    pub device_id: Option<String>,
    pub tag: Option<String>,
}

/// Persist a new profile.  Fails with `profile_exists` when the id is
/// already taken.
pub fn create_profile(db: &Db, profile: &Profile) -> Result<ProfileRow> {
    profile.validate()?;
    let id = db.insert_profile(profile)?;
    debug!(profile_id = %profile.profile_id, id, "profile created");
    db.get_profile_row_by_id(id).map_err(Error::from)
}

pub fn get_profile(db: &Db, profile_id: &str) -> Result<ProfileRow> {
    db.get_profile_row(profile_id).map_err(Error::from)
}

pub fn list_profiles(db: &Db) -> Result<Vec<ProfileRow>> {
    db.list_profile_rows().map_err(Error::from)
}

pub fn query_profiles(db: &Db, query: &ProfileQuery) -> Result<Vec<ProfileRow>> {
    let rows = db.list_profile_rows()?;
    Ok(rows
        .into_iter()
        .filter(|row| {
            let p = &row.profile;
            query
                .openwrt_release
                .as_ref()
                .map_or(true, |v| &p.openwrt_release == v)
                && query.target.as_ref().map_or(true, |v| &p.target == v)
                && query.device_id.as_ref().map_or(true, |v| &p.device_id == v)
                && query.tag.as_ref().map_or(true, |v| p.tags.contains(v))
        })
        .collect())
}

/// Replace a stored profile.  The id embedded in the new profile must match
/// the id being updated; a mismatch fails with `profile_id_mismatch`.
pub fn update_profile(db: &Db, profile_id: &str, profile: &Profile) -> Result<ProfileRow> {
    profile.validate()?;
    db.update_profile(profile_id, profile)?;
    db.get_profile_row(profile_id).map_err(Error::from)
}

/// Delete a profile and everything it owns: build rows cascade, and each
/// deleted build's directory subtree goes with it.
pub fn delete_profile(db: &Db, profile_id: &str) -> Result<()> {
    let build_dirs = db.delete_profile(profile_id)?;
    for dir in build_dirs {
        let path = Path::new(&dir);
        if path.exists() {
            if let Err(e) = remove_dir_all(path) {
                warn!(dir, error = %e, "failed to remove build directory");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Profile {
        Profile::new(
            "t1",
            "dev-1",
            "23.05.3",
            "ath79",
            "generic",
            "tplink_archer-c7-v2",
        )
    }

    #[test]
    fn test_validate_minimal() {
        minimal().validate().unwrap();
    }

    #[test]
    fn test_profile_id_pattern() {
        let mut p = minimal();
        p.profile_id = "ok-id_1.2".to_string();
        p.validate().unwrap();
        p.profile_id = "bad id".to_string();
        assert_eq!(p.validate().unwrap_err().kind(), "validation");
        p.profile_id = String::new();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_destination_must_be_absolute() {
        let mut p = minimal();
        p.files.push(FileSpec {
            source: "banner".to_string(),
            destination: "etc/banner".to_string(),
            mode: None,
            owner: None,
        });
        assert!(p.validate().is_err());
        p.files[0].destination = "/etc/banner".to_string();
        p.validate().unwrap();
    }

    #[test]
    fn test_mode_must_be_octal() {
        let mut p = minimal();
        p.files.push(FileSpec {
            source: "banner".to_string(),
            destination: "/etc/banner".to_string(),
            mode: Some("0888".to_string()),
            owner: None,
        });
        assert!(p.validate().is_err());
        p.files[0].mode = Some("0644".to_string());
        p.validate().unwrap();
        p.files[0].mode = Some("644".to_string());
        p.validate().unwrap();
    }

    #[test]
    fn test_snapshot_requires_policy() {
        let mut p = minimal();
        p.openwrt_release = "snapshot".to_string();
        assert!(p.validate().is_err());
        p.policies = Some(ProfilePolicies {
            allow_snapshot: Some(true),
            ..Default::default()
        });
        p.validate().unwrap();
    }

    #[test]
    fn test_rootfs_partsize_positive() {
        let mut p = minimal();
        p.rootfs_partsize = Some(0);
        assert!(p.validate().is_err());
        p.rootfs_partsize = Some(256);
        p.validate().unwrap();
    }

    #[test]
    fn test_filesystem_policy() {
        let mut p = minimal();
        p.policies = Some(ProfilePolicies {
            filesystem: Some("btrfs".to_string()),
            ..Default::default()
        });
        assert!(p.validate().is_err());
        p.policies.as_mut().unwrap().filesystem = Some("squashfs".to_string());
        p.validate().unwrap();
    }

    #[test]
    fn test_crud_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let p = minimal();
        let row = create_profile(&db, &p).unwrap();
        assert_eq!(row.profile, p);

        // duplicate id rejected
        assert_eq!(
            create_profile(&db, &p).unwrap_err().kind(),
            "profile_exists"
        );

        // update
        let mut p2 = p.clone();
        p2.packages = vec!["luci".to_string()];
        let row2 = update_profile(&db, "t1", &p2).unwrap();
        assert_eq!(row2.profile.packages, vec!["luci".to_string()]);
        assert_eq!(row2.id, row.id);

        // id change rejected
        let mut p3 = p2.clone();
        p3.profile_id = "t2".to_string();
        assert_eq!(
            update_profile(&db, "t1", &p3).unwrap_err().kind(),
            "profile_id_mismatch"
        );

        // query
        let hits = query_profiles(
            &db,
            &ProfileQuery {
                openwrt_release: Some("23.05.3".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = query_profiles(
            &db,
            &ProfileQuery {
                target: Some("ramips".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(misses.is_empty());

        // delete
        delete_profile(&db, "t1").unwrap();
        assert_eq!(
            get_profile(&db, "t1").unwrap_err().kind(),
            "profile_not_found"
        );
    }
}
