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

//! Block-device validation for flashing.
//!
//! Safety rules: explicit device paths only, whole devices only, never the
//! device backing the root filesystem, and nothing mounted unless the
//! caller explicitly allows it.

use std::fs::{metadata, read_to_string};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::DeviceError;

type Result<T> = std::result::Result<T, DeviceError>;

const PROC_MOUNTS: &str = "/proc/mounts";

lazy_static! {
    // /dev/sda1, /dev/hdb2, /dev/vdc3
    static ref PARTITION_SD: Regex = Regex::new(r"^/dev/[shv]d[a-z]+(\d+)$").unwrap();
    // /dev/nvme0n1p1
    static ref PARTITION_NVME: Regex = Regex::new(r"^/dev/nvme\d+n\d+p(\d+)$").unwrap();
    // /dev/mmcblk0p1
    static ref PARTITION_MMC: Regex = Regex::new(r"^/dev/mmcblk\d+p(\d+)$").unwrap();
    // /dev/loop0p1
    static ref PARTITION_LOOP: Regex = Regex::new(r"^/dev/loop\d+p(\d+)$").unwrap();
}

/// A validated block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub is_block_device: bool,
    pub is_whole_device: bool,
    pub is_mounted: bool,
    pub mount_points: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

/// Validation knobs.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub check_mount: bool,
    pub check_system_device: bool,
    pub allow_mounted: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        ValidateOptions {
            check_mount: true,
            check_system_device: true,
            allow_mounted: false,
        }
    }
}

/// Whether the path names a partition by naming convention.
pub fn is_partition_path(device_path: &str) -> bool {
    [
        &*PARTITION_SD,
        &*PARTITION_NVME,
        &*PARTITION_MMC,
        &*PARTITION_LOOP,
    ]
    .iter()
    .any(|re| re.is_match(device_path))
}

/// Reduce a partition path to its whole-device form: strip the trailing
/// digits for the sd family, or the `p<N>` suffix for the others.  A path
/// that matches no partition pattern is returned unchanged.
pub fn partition_to_whole_device(partition_path: &str) -> String {
    if let Some(captures) = PARTITION_SD.captures(partition_path) {
        let digits = captures.get(1).expect("pattern has one group").as_str();
        return partition_path[..partition_path.len() - digits.len()].to_string();
    }
    for re in [&*PARTITION_NVME, &*PARTITION_MMC, &*PARTITION_LOOP] {
        if re.is_match(partition_path) {
            if let Some(pos) = partition_path.rfind('p') {
                return partition_path[..pos].to_string();
            }
        }
    }
    partition_path.to_string()
}

fn is_block_device(path: &Path) -> bool {
    metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Mount points of a device or any of its partitions in a mount table
/// document (lines of `device mountpoint fstype flags ...`).  A partition
/// is the device name followed by a digit, or `p` plus digits, covering
/// both the `sdb1` and `mmcblk0p1` conventions.
fn mount_points_in(mounts: &str, device_path: &str) -> Vec<String> {
    let device_name = match Path::new(device_path).file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return Vec::new(),
    };
    let mut points = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(mounted_device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        let mounted_name = match Path::new(mounted_device).file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        let is_match = if mounted_name == device_name {
            true
        } else if let Some(rest) = mounted_name.strip_prefix(device_name) {
            rest.chars().next().map_or(false, |c| c.is_ascii_digit())
                || (rest.starts_with('p')
                    && rest[1..].chars().next().map_or(false, |c| c.is_ascii_digit()))
        } else {
            false
        };
        if is_match {
            points.push(mount_point.to_string());
        }
    }
    points
}

/// Device containing `/` in a mount table document, reduced to its
/// whole-device form.
fn root_device_in(mounts: &str) -> Option<String> {
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if mount_point == "/" {
            return Some(partition_to_whole_device(device));
        }
    }
    None
}

fn read_mounts() -> Option<String> {
    match read_to_string(PROC_MOUNTS) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(error = %e, "could not read {PROC_MOUNTS}, skipping mount checks");
            None
        }
    }
}

/// Mount points of a device and its partitions, from the live system
/// mount table.
pub fn get_mount_points(device_path: &str) -> Vec<String> {
    read_mounts()
        .map(|mounts| mount_points_in(&mounts, device_path))
        .unwrap_or_default()
}

/// Whole-device path backing the root filesystem, if determinable.
pub fn get_root_device() -> Option<String> {
    root_device_in(&read_mounts()?)
}

/// Device size via sysfs (`/sys/block/<name>/size`, 512-byte sectors).
/// Missing or unreadable is tolerated as unknown.
pub fn get_device_size(device_path: &str) -> Option<u64> {
    let name = Path::new(device_path).file_name()?.to_str()?;
    let sectors: u64 = read_to_string(format!("/sys/block/{name}/size"))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(sectors * 512)
}

fn read_sysfs_field(device_path: &str, field: &str) -> Option<String> {
    let name = Path::new(device_path).file_name()?.to_str()?;
    let value = read_to_string(format!("/sys/block/{name}/device/{field}")).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Validate a device path for flashing.
///
/// 1. must exist, 2. must be a block device, 3. must be a whole device,
/// 4. must not back the root filesystem (optional), 5. must not be
/// mounted (optional).
pub fn validate_device(device_path: &str, options: &ValidateOptions) -> Result<DeviceInfo> {
    let device_path = if Path::new(device_path).is_absolute() {
        PathBuf::from(device_path)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(device_path)
    };
    let device_path = device_path.to_string_lossy().into_owned();
    debug!(device = %device_path, "validating device");

    if !Path::new(&device_path).exists() {
        return Err(DeviceError::NotFound(device_path));
    }
    if !is_block_device(Path::new(&device_path)) {
        return Err(DeviceError::NotBlockDevice(device_path));
    }
    if is_partition_path(&device_path) {
        return Err(DeviceError::Partition(device_path));
    }

    if options.check_system_device {
        if let Some(root_device) = get_root_device() {
            if root_device == device_path {
                return Err(DeviceError::SystemDevice(device_path));
            }
        }
    }

    let mut mount_points = Vec::new();
    let mut is_mounted = false;
    if options.check_mount {
        mount_points = get_mount_points(&device_path);
        is_mounted = !mount_points.is_empty();
        if is_mounted {
            if !options.allow_mounted {
                return Err(DeviceError::Mounted {
                    device: device_path,
                    mount_points,
                });
            }
            warn!(device = %device_path, ?mount_points, "device has mounted partitions");
        }
    }

    let size_bytes = get_device_size(&device_path);
    info!(device = %device_path, size_bytes, is_mounted, "device validated");
    Ok(DeviceInfo {
        model: read_sysfs_field(&device_path, "model"),
        serial: read_sysfs_field(&device_path, "serial"),
        path: device_path,
        is_block_device: true,
        is_whole_device: true,
        is_mounted,
        mount_points,
        size_bytes,
    })
}
