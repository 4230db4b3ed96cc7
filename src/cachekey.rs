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

//! Cache key computation.
//!
//! All build-affecting inputs are normalized into a canonical JSON document
//! and hashed; equal keys guarantee equal artifacts.  Canonical form: object
//! keys sorted lexicographically, no insignificant whitespace, absent fields
//! omitted (never emitted as null), pre-sorted arrays where specified.
//! `serde_json`'s default map representation is a `BTreeMap`, so building a
//! `Value` and serializing it compactly yields exactly this form.

use std::collections::{BTreeMap, BTreeSet};

use openssl::sha::Sha256;
use serde_json::{json, Map, Value};

use crate::profile::Profile;

/// Version of the cache key format; bumping it invalidates all prior keys.
pub const CACHE_KEY_SCHEMA_VERSION: &str = "1";

/// Canonical representation of all inputs that affect build output.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInputs {
    pub schema_version: String,
    pub profile_snapshot: Map<String, Value>,
    pub imagebuilder_key: (String, String, String),
    pub effective_packages: Vec<String>,
    pub overlay_hash: Option<String>,
    pub build_options: BTreeMap<String, Value>,
}

impl BuildInputs {
    /// The exact JSON document that gets hashed (and persisted verbatim in
    /// `BuildRecord.input_snapshot` for cache-drift diagnosis).
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            "schema_version".to_string(),
            Value::String(self.schema_version.clone()),
        );
        root.insert(
            "profile_snapshot".to_string(),
            Value::Object(self.profile_snapshot.clone()),
        );
        root.insert(
            "imagebuilder_key".to_string(),
            json!([
                self.imagebuilder_key.0,
                self.imagebuilder_key.1,
                self.imagebuilder_key.2
            ]),
        );
        root.insert(
            "effective_packages".to_string(),
            json!(self.effective_packages),
        );
        if let Some(hash) = &self.overlay_hash {
            root.insert("overlay_hash".to_string(), Value::String(hash.clone()));
        }
        root.insert(
            "build_options".to_string(),
            Value::Object(self.build_options.clone().into_iter().collect()),
        );
        Value::Object(root)
    }
}

/// Extract only the build-affecting fields of a profile, normalized.
/// Absent fields are omitted; list-valued fields are sorted except `files`,
/// whose order is meaningful (later specs override earlier ones).
pub fn normalize_profile_snapshot(profile: &Profile) -> Map<String, Value> {
    let mut snapshot = Map::new();
    snapshot.insert("profile_id".into(), json!(profile.profile_id));
    snapshot.insert("openwrt_release".into(), json!(profile.openwrt_release));
    snapshot.insert("target".into(), json!(profile.target));
    snapshot.insert("subtarget".into(), json!(profile.subtarget));
    snapshot.insert(
        "imagebuilder_profile".into(),
        json!(profile.imagebuilder_profile),
    );

    if !profile.packages.is_empty() {
        let mut packages = profile.packages.clone();
        packages.sort();
        snapshot.insert("packages".into(), json!(packages));
    }
    if !profile.packages_remove.is_empty() {
        let mut remove = profile.packages_remove.clone();
        remove.sort();
        snapshot.insert("packages_remove".into(), json!(remove));
    }

    // File contents are captured by overlay_hash; the specs themselves are
    // recorded so that renames and mode changes are visible too.
    if !profile.files.is_empty() {
        let files: Vec<Value> = profile
            .files
            .iter()
            .map(|f| {
                let mut m = Map::new();
                m.insert("source".into(), json!(f.source));
                m.insert("destination".into(), json!(f.destination));
                if let Some(mode) = &f.mode {
                    m.insert("mode".into(), json!(mode));
                }
                if let Some(owner) = &f.owner {
                    m.insert("owner".into(), json!(owner));
                }
                Value::Object(m)
            })
            .collect();
        snapshot.insert("files".into(), Value::Array(files));
    }
    if let Some(dir) = &profile.overlay_dir {
        snapshot.insert("overlay_dir".into(), json!(dir));
    }
    if let Some(bin_dir) = &profile.bin_dir {
        snapshot.insert("bin_dir".into(), json!(bin_dir));
    }
    if let Some(name) = &profile.extra_image_name {
        snapshot.insert("extra_image_name".into(), json!(name));
    }
    if !profile.disabled_services.is_empty() {
        let mut services = profile.disabled_services.clone();
        services.sort();
        snapshot.insert("disabled_services".into(), json!(services));
    }
    if let Some(size) = profile.rootfs_partsize {
        snapshot.insert("rootfs_partsize".into(), json!(size));
    }
    if let Some(add_key) = profile.add_local_key {
        snapshot.insert("add_local_key".into(), json!(add_key));
    }

    if let Some(policies) = &profile.policies {
        let mut reduced = Map::new();
        if let Some(fs) = &policies.filesystem {
            reduced.insert("filesystem".into(), json!(fs));
        }
        if let Some(v) = policies.include_kernel_symbols {
            reduced.insert("include_kernel_symbols".into(), json!(v));
        }
        if let Some(v) = policies.strip_debug {
            reduced.insert("strip_debug".into(), json!(v));
        }
        if !reduced.is_empty() {
            snapshot.insert("policies".into(), Value::Object(reduced));
        }
    }

    snapshot
}

/// Merge profile packages with build-time extras; removals lose their plain
/// entry and come back prefixed with `-`.  The result is sorted and
/// duplicate-free.
pub fn compute_effective_packages(profile: &Profile, extra_packages: &[String]) -> Vec<String> {
    let mut packages: BTreeSet<String> = profile.packages.iter().cloned().collect();
    packages.extend(extra_packages.iter().cloned());
    for pkg in &profile.packages_remove {
        packages.remove(pkg);
        packages.insert(format!("-{pkg}"));
    }
    packages.into_iter().collect()
}

pub fn create_build_inputs(
    profile: &Profile,
    overlay_hash: Option<String>,
    extra_packages: &[String],
    build_options: &BTreeMap<String, Value>,
) -> BuildInputs {
    BuildInputs {
        schema_version: CACHE_KEY_SCHEMA_VERSION.to_string(),
        profile_snapshot: normalize_profile_snapshot(profile),
        imagebuilder_key: (
            profile.openwrt_release.clone(),
            profile.target.clone(),
            profile.subtarget.clone(),
        ),
        effective_packages: compute_effective_packages(profile, extra_packages),
        overlay_hash,
        build_options: build_options.clone(),
    }
}

/// SHA-256 over the canonical JSON, as `sha256:<64 hex>`.
pub fn compute_cache_key(inputs: &BuildInputs) -> String {
    let canonical = inputs.to_value().to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finish()))
}

/// Convenience path from profile straight to `(cache_key, inputs)`.
pub fn compute_cache_key_from_profile(
    profile: &Profile,
    overlay_hash: Option<String>,
    extra_packages: &[String],
    build_options: &BTreeMap<String, Value>,
) -> (String, BuildInputs) {
    let inputs = create_build_inputs(profile, overlay_hash, extra_packages, build_options);
    let key = compute_cache_key(&inputs);
    (key, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{FileSpec, ProfilePolicies};

    fn base_profile() -> Profile {
        let mut p = Profile::new("t1", "dev", "23.05.3", "ath79", "generic", "archer");
        p.packages = vec!["luci".to_string(), "curl".to_string()];
        p
    }

    fn key_of(p: &Profile) -> String {
        compute_cache_key_from_profile(p, None, &[], &BTreeMap::new()).0
    }

    #[test]
    fn test_key_shape() {
        let key = key_of(&base_profile());
        assert!(key.starts_with("sha256:"));
        assert_eq!(key.len(), "sha256:".len() + 64);
        assert!(key["sha256:".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_determinism_under_list_permutation() {
        let mut a = base_profile();
        a.packages = vec!["luci".into(), "curl".into(), "tcpdump".into()];
        a.disabled_services = vec!["dnsmasq".into(), "odhcpd".into()];

        let mut b = base_profile();
        b.packages = vec!["tcpdump".into(), "luci".into(), "curl".into()];
        b.disabled_services = vec!["odhcpd".into(), "dnsmasq".into()];

        assert_eq!(key_of(&a), key_of(&b));
    }

    #[test]
    fn test_sensitivity_to_each_field() {
        let base = key_of(&base_profile());

        let mut p = base_profile();
        p.packages.push("tcpdump".into());
        assert_ne!(key_of(&p), base);

        let mut p = base_profile();
        p.imagebuilder_profile = "other".into();
        assert_ne!(key_of(&p), base);

        let mut p = base_profile();
        p.add_local_key = Some(true);
        assert_ne!(key_of(&p), base);

        let mut p = base_profile();
        p.rootfs_partsize = Some(256);
        assert_ne!(key_of(&p), base);

        let mut p = base_profile();
        p.policies = Some(ProfilePolicies {
            strip_debug: Some(true),
            ..Default::default()
        });
        assert_ne!(key_of(&p), base);
    }

    #[test]
    fn test_overlay_hash_changes_key() {
        let p = base_profile();
        let k1 = compute_cache_key_from_profile(&p, Some("a".repeat(64)), &[], &BTreeMap::new()).0;
        let k2 = compute_cache_key_from_profile(&p, Some("b".repeat(64)), &[], &BTreeMap::new()).0;
        let k3 = compute_cache_key_from_profile(&p, None, &[], &BTreeMap::new()).0;
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let p = base_profile();
        let value = create_build_inputs(&p, None, &[], &BTreeMap::new()).to_value();
        let text = value.to_string();
        assert!(!text.contains("null"), "canonical JSON must omit absent fields: {text}");
        assert!(!text.contains("overlay_hash"));
        let snapshot = value.get("profile_snapshot").unwrap();
        assert!(snapshot.get("files").is_none());
        assert!(snapshot.get("policies").is_none());
    }

    #[test]
    fn test_empty_policies_block_omitted() {
        let mut p = base_profile();
        // allow_snapshot and auto_resize_rootfs are not build-affecting
        p.policies = Some(ProfilePolicies {
            allow_snapshot: Some(true),
            auto_resize_rootfs: Some(true),
            ..Default::default()
        });
        assert_eq!(key_of(&p), key_of(&base_profile()));
    }

    #[test]
    fn test_canonical_json_is_sorted_and_compact() {
        let mut p = base_profile();
        p.files = vec![FileSpec {
            source: "banner".into(),
            destination: "/etc/banner".into(),
            mode: Some("0644".into()),
            owner: None,
        }];
        let text = create_build_inputs(&p, Some("ff".repeat(32)), &[], &BTreeMap::new())
            .to_value()
            .to_string();
        assert!(!text.contains(": "));
        assert!(!text.contains(", "));
        // top-level keys appear in lexicographic order
        let order = [
            "build_options",
            "effective_packages",
            "imagebuilder_key",
            "overlay_hash",
            "profile_snapshot",
            "schema_version",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|k| text.find(&format!("\"{k}\"")).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        // owner was None and must be absent from the file spec
        assert!(!text.contains("owner"));
    }

    #[test]
    fn test_effective_packages_merge_and_removal() {
        let mut p = base_profile();
        p.packages = vec!["luci".into(), "ppp".into()];
        p.packages_remove = vec!["ppp".into(), "dnsmasq".into()];
        let effective =
            compute_effective_packages(&p, &["tcpdump".to_string(), "luci".to_string()]);
        assert_eq!(
            effective,
            vec![
                "-dnsmasq".to_string(),
                "-ppp".to_string(),
                "luci".to_string(),
                "tcpdump".to_string(),
            ]
        );
    }

    #[test]
    fn test_build_options_affect_key() {
        let p = base_profile();
        let mut opts = BTreeMap::new();
        opts.insert("initramfs".to_string(), json!(true));
        let k1 = compute_cache_key_from_profile(&p, None, &[], &opts).0;
        let k2 = compute_cache_key_from_profile(&p, None, &[], &BTreeMap::new()).0;
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_imagebuilder_key_serializes_as_array() {
        let p = base_profile();
        let value = create_build_inputs(&p, None, &[], &BTreeMap::new()).to_value();
        assert_eq!(
            value.get("imagebuilder_key").unwrap(),
            &json!(["23.05.3", "ath79", "generic"])
        );
    }
}
