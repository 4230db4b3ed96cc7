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

//! Artifact discovery and manifest generation.
//!
//! Walks a build output directory, classifies each file by name, hashes it,
//! and emits `manifest.json` with stable key ordering.

use std::collections::BTreeSet;
use std::fs::{create_dir_all, write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::Error;
use crate::io::sha256_file;
use crate::types::{ArtifactInfo, ArtifactKind};

/// Manifest format version.
pub const MANIFEST_VERSION: &str = "1.0";

/// Files below this size are skipped unless they are metadata files.
const MIN_ARTIFACT_SIZE: u64 = 1024;

// Classification patterns, lowercase, in priority order.  The order
// matters: `-initramfs-kernel.bin` must win over `-kernel.bin`, and
// `-kernel.bin` maps to factory because some device families ship a
// kernel-only factory install.
const SYSUPGRADE_PATTERNS: &[&str] = &["-sysupgrade.bin", "-sysupgrade.img.gz"];
const INITRAMFS_PATTERNS: &[&str] = &["-initramfs-kernel.bin", "-initramfs.bin"];
const FACTORY_PATTERNS: &[&str] = &["-factory.bin", "-factory.img", "-kernel.bin"];
const KERNEL_PATTERNS: &[&str] = &["-uimage", "-vmlinux"];
const ROOTFS_PATTERNS: &[&str] = &["-rootfs.tar.gz", "-rootfs.squashfs", "-rootfs.ext4"];
const MANIFEST_PATTERNS: &[&str] = &[".manifest"];

/// Classify an artifact by filename substring, case-insensitive.
pub fn classify_artifact(filename: &str) -> ArtifactKind {
    let name = filename.to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| name.contains(p));

    if matches(SYSUPGRADE_PATTERNS) {
        ArtifactKind::Sysupgrade
    } else if matches(INITRAMFS_PATTERNS) {
        ArtifactKind::Initramfs
    } else if matches(FACTORY_PATTERNS) {
        ArtifactKind::Factory
    } else if matches(KERNEL_PATTERNS) {
        ArtifactKind::Kernel
    } else if matches(ROOTFS_PATTERNS) {
        ArtifactKind::Rootfs
    } else if matches(MANIFEST_PATTERNS) {
        ArtifactKind::Manifest
    } else {
        ArtifactKind::Other
    }
}

fn labels_for(kind: ArtifactKind) -> Vec<String> {
    match kind {
        ArtifactKind::Sysupgrade => vec!["for_tf_flash".to_string()],
        ArtifactKind::Factory => vec!["for_factory_install".to_string()],
        _ => Vec::new(),
    }
}

/// Whether a filename passes the extension whitelist.  `.gz` only counts
/// combined with `.img` or `.tar`; the metadata extensions are gated on
/// `include_non_binary`.
fn is_metadata_name(name: &str) -> bool {
    name.ends_with(".manifest") || name.ends_with(".buildinfo") || name.ends_with(".json")
}

fn passes_whitelist(name: &str, include_non_binary: bool) -> bool {
    let binary = name.ends_with(".bin")
        || name.ends_with(".img")
        || name.ends_with(".img.gz")
        || name.ends_with(".tar")
        || name.ends_with(".tar.gz")
        || name.ends_with(".squashfs")
        || name.ends_with(".ext4");
    binary || (include_non_binary && is_metadata_name(name))
}

/// Discover artifacts in a build output directory.  `artifacts_root` is
/// the base for `relative_path` computation (the output dir itself when
/// `None`).
pub fn discover_artifacts(
    bin_dir: &Path,
    artifacts_root: Option<&Path>,
    include_non_binary: bool,
) -> Result<Vec<ArtifactInfo>, Error> {
    if !bin_dir.exists() {
        warn!(dir = %bin_dir.display(), "build output directory does not exist");
        return Ok(Vec::new());
    }
    let artifacts_root = artifacts_root.unwrap_or(bin_dir);

    let mut paths: Vec<_> = WalkDir::new(bin_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();

    let mut artifacts = Vec::new();
    for path in paths {
        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let name_lower = filename.to_ascii_lowercase();
        if !passes_whitelist(&name_lower, include_non_binary) {
            continue;
        }

        let size_bytes = path
            .metadata()
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("statting artifact")))?
            .len();
        if size_bytes < MIN_ARTIFACT_SIZE && !is_metadata_name(&name_lower) {
            debug!(file = %filename, size_bytes, "skipping small file");
            continue;
        }

        let (sha256, _) = sha256_file(&path, None)
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("hashing artifact")))?;
        let kind = classify_artifact(&filename);
        let relative_path = path
            .strip_prefix(artifacts_root)
            .unwrap_or(Path::new(&filename))
            .to_string_lossy()
            .into_owned();

        debug!(file = %filename, kind = %kind, size_bytes, "discovered artifact");
        artifacts.push(ArtifactInfo {
            filename,
            relative_path,
            size_bytes,
            sha256,
            kind,
            labels: labels_for(kind),
        });
    }

    info!(count = artifacts.len(), dir = %bin_dir.display(), "artifact discovery complete");
    Ok(artifacts)
}

/// Optional identity fields embedded in a manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestContext {
    pub build_id: Option<i64>,
    pub cache_key: Option<String>,
    pub profile_id: Option<String>,
    pub build_inputs: Option<Value>,
    pub metadata: Option<Value>,
}

/// Assemble the manifest document.  Key order is stable (sorted).
pub fn generate_manifest(artifacts: &[ArtifactInfo], context: &ManifestContext) -> Value {
    let mut manifest = Map::new();
    manifest.insert("version".to_string(), json!(MANIFEST_VERSION));
    manifest.insert(
        "generated_at".to_string(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    manifest.insert("artifacts".to_string(), json!(artifacts));

    if let Some(build_id) = context.build_id {
        manifest.insert("build_id".to_string(), json!(build_id));
    }
    if let Some(cache_key) = &context.cache_key {
        manifest.insert("cache_key".to_string(), json!(cache_key));
    }
    if let Some(profile_id) = &context.profile_id {
        manifest.insert("profile_id".to_string(), json!(profile_id));
    }
    if let Some(inputs) = &context.build_inputs {
        manifest.insert("build_inputs".to_string(), inputs.clone());
    }
    if let Some(metadata) = &context.metadata {
        manifest.insert("metadata".to_string(), metadata.clone());
    }

    let kinds: BTreeSet<&str> = artifacts.iter().map(|a| a.kind.as_str()).collect();
    manifest.insert(
        "summary".to_string(),
        json!({
            "total_artifacts": artifacts.len(),
            "total_size_bytes": artifacts.iter().map(|a| a.size_bytes).sum::<u64>(),
            "kinds": kinds.into_iter().collect::<Vec<_>>(),
        }),
    );

    Value::Object(manifest)
}

/// Write the manifest as pretty-printed JSON.
pub fn write_manifest(manifest: &Value, output_path: &Path) -> Result<(), Error> {
    if let Some(parent) = output_path.parent() {
        create_dir_all(parent)
            .map_err(|e| Error::Internal(anyhow::Error::new(e).context("creating manifest dir")))?;
    }
    let body = serde_json::to_string_pretty(manifest)
        .map_err(|e| Error::Internal(anyhow::Error::new(e).context("encoding manifest")))?;
    write(output_path, body)
        .map_err(|e| Error::Internal(anyhow::Error::new(e).context("writing manifest")))?;
    info!(path = %output_path.display(), "wrote manifest");
    Ok(())
}

/// Pick the artifact to flash: sysupgrade, then factory, then any other
/// binary kind.
pub fn get_primary_artifact(artifacts: &[ArtifactInfo]) -> Option<&ArtifactInfo> {
    for kind in [ArtifactKind::Sysupgrade, ArtifactKind::Factory] {
        if let Some(a) = artifacts.iter().find(|a| a.kind == kind) {
            return Some(a);
        }
    }
    artifacts
        .iter()
        .find(|a| !matches!(a.kind, ArtifactKind::Manifest | ArtifactKind::Other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write as fs_write;
    use tempfile::TempDir;

    #[test]
    fn test_classification_priority() {
        assert_eq!(
            classify_artifact("openwrt-23.05.3-ath79-generic-tplink_archer-c7-v2-squashfs-sysupgrade.bin"),
            ArtifactKind::Sysupgrade
        );
        assert_eq!(
            classify_artifact("openwrt-x86-64-generic-squashfs-sysupgrade.img.gz"),
            ArtifactKind::Sysupgrade
        );
        // initramfs wins over the overlapping -kernel.bin factory pattern
        assert_eq!(
            classify_artifact("openwrt-initramfs-kernel.bin"),
            ArtifactKind::Initramfs
        );
        assert_eq!(
            classify_artifact("openwrt-ramips-initramfs.bin"),
            ArtifactKind::Initramfs
        );
        // bare -kernel.bin is factory per historical convention
        assert_eq!(
            classify_artifact("openwrt-ath79-kernel.bin"),
            ArtifactKind::Factory
        );
        assert_eq!(
            classify_artifact("openwrt-factory.img"),
            ArtifactKind::Factory
        );
        assert_eq!(classify_artifact("openwrt-uImage"), ArtifactKind::Kernel);
        assert_eq!(classify_artifact("openwrt-vmlinux"), ArtifactKind::Kernel);
        assert_eq!(
            classify_artifact("openwrt-rootfs.squashfs"),
            ArtifactKind::Rootfs
        );
        assert_eq!(
            classify_artifact("openwrt-rootfs.tar.gz"),
            ArtifactKind::Rootfs
        );
        assert_eq!(
            classify_artifact("openwrt.manifest"),
            ArtifactKind::Manifest
        );
        assert_eq!(classify_artifact("sha256sums"), ArtifactKind::Other);
    }

    #[test]
    fn test_classification_case_insensitive() {
        assert_eq!(
            classify_artifact("OpenWrt-SYSUPGRADE.BIN"),
            ArtifactKind::Sysupgrade
        );
    }

    fn big(data: u8) -> Vec<u8> {
        vec![data; 4096]
    }

    #[test]
    fn test_discovery_whitelist_and_size_floor() {
        let dir = TempDir::new().unwrap();
        fs_write(dir.path().join("a-sysupgrade.bin"), big(1)).unwrap();
        fs_write(dir.path().join("ignored.txt"), big(2)).unwrap();
        fs_write(dir.path().join("random.gz"), big(3)).unwrap();
        fs_write(dir.path().join("tiny-factory.bin"), b"small").unwrap();

        let artifacts = discover_artifacts(dir.path(), None, false).unwrap();
        let names: Vec<_> = artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["a-sysupgrade.bin"]);
        assert_eq!(artifacts[0].kind, ArtifactKind::Sysupgrade);
        assert_eq!(artifacts[0].labels, vec!["for_tf_flash".to_string()]);
        assert_eq!(artifacts[0].size_bytes, 4096);
        assert_eq!(artifacts[0].sha256.len(), 64);
    }

    #[test]
    fn test_discovery_includes_metadata_when_asked() {
        let dir = TempDir::new().unwrap();
        // metadata files pass even below the size floor
        fs_write(dir.path().join("build.buildinfo"), b"x").unwrap();
        fs_write(dir.path().join("packages.manifest"), b"y").unwrap();

        assert!(discover_artifacts(dir.path(), None, false).unwrap().is_empty());
        let artifacts = discover_artifacts(dir.path(), None, true).unwrap();
        assert_eq!(artifacts.len(), 2);
    }

    #[test]
    fn test_discovery_relative_paths_against_root() {
        let root = TempDir::new().unwrap();
        let bin_dir = root.path().join("23.05.3/ath79/generic/t1/00000001_ab/bin");
        create_dir_all(&bin_dir).unwrap();
        fs_write(bin_dir.join("img-factory.bin"), big(4)).unwrap();

        let artifacts = discover_artifacts(&bin_dir, Some(root.path()), false).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(
            artifacts[0].relative_path,
            "23.05.3/ath79/generic/t1/00000001_ab/bin/img-factory.bin"
        );
        assert_eq!(
            artifacts[0].labels,
            vec!["for_factory_install".to_string()]
        );
    }

    #[test]
    fn test_discovery_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let artifacts = discover_artifacts(&dir.path().join("nope"), None, false).unwrap();
        assert!(artifacts.is_empty());
    }

    fn sample_artifacts() -> Vec<ArtifactInfo> {
        vec![
            ArtifactInfo {
                filename: "a-sysupgrade.bin".to_string(),
                relative_path: "bin/a-sysupgrade.bin".to_string(),
                size_bytes: 100,
                sha256: "aa".repeat(32),
                kind: ArtifactKind::Sysupgrade,
                labels: vec!["for_tf_flash".to_string()],
            },
            ArtifactInfo {
                filename: "a-rootfs.squashfs".to_string(),
                relative_path: "bin/a-rootfs.squashfs".to_string(),
                size_bytes: 50,
                sha256: "bb".repeat(32),
                kind: ArtifactKind::Rootfs,
                labels: vec![],
            },
        ]
    }

    #[test]
    fn test_manifest_contents() {
        let context = ManifestContext {
            build_id: Some(7),
            cache_key: Some(format!("sha256:{}", "0".repeat(64))),
            profile_id: Some("t1".to_string()),
            build_inputs: Some(json!({"schema_version": "1"})),
            metadata: None,
        };
        let manifest = generate_manifest(&sample_artifacts(), &context);
        assert_eq!(manifest["version"], json!(MANIFEST_VERSION));
        assert_eq!(manifest["build_id"], json!(7));
        assert_eq!(manifest["profile_id"], json!("t1"));
        assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 2);
        assert_eq!(manifest["summary"]["total_artifacts"], json!(2));
        assert_eq!(manifest["summary"]["total_size_bytes"], json!(150));
        // kinds are sorted and unique
        assert_eq!(manifest["summary"]["kinds"], json!(["rootfs", "sysupgrade"]));
        assert!(manifest.get("metadata").is_none());
        // ISO-8601 UTC timestamp
        let ts = manifest["generated_at"].as_str().unwrap();
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn test_manifest_written_with_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/manifest.json");
        let manifest = generate_manifest(&sample_artifacts(), &ManifestContext::default());
        write_manifest(&manifest, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let a = text.find("\"artifacts\"").unwrap();
        let g = text.find("\"generated_at\"").unwrap();
        let s = text.find("\"summary\"").unwrap();
        let v = text.find("\"version\"").unwrap();
        assert!(a < g && g < s && s < v);
        // round-trips as JSON
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_primary_artifact_preference() {
        let mut artifacts = sample_artifacts();
        assert_eq!(
            get_primary_artifact(&artifacts).unwrap().kind,
            ArtifactKind::Sysupgrade
        );
        artifacts.remove(0);
        // no sysupgrade or factory: falls back to any binary kind
        assert_eq!(
            get_primary_artifact(&artifacts).unwrap().kind,
            ArtifactKind::Rootfs
        );
        artifacts.clear();
        assert!(get_primary_artifact(&artifacts).is_none());
    }
}
