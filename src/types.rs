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

//! Shared enums and small value types used across the pipeline.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Status of a build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl Display for BuildStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a flash record.  Same lifecycle shape as [`BuildStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl FlashStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashStatus::Pending => "pending",
            FlashStatus::Running => "running",
            FlashStatus::Succeeded => "succeeded",
            FlashStatus::Failed => "failed",
        }
    }
}

impl FromStr for FlashStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(FlashStatus::Pending),
            "running" => Ok(FlashStatus::Running),
            "succeeded" => Ok(FlashStatus::Succeeded),
            "failed" => Ok(FlashStatus::Failed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl Display for FlashStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a cached Image Builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageBuilderState {
    Pending,
    Ready,
    Broken,
    Deprecated,
}

impl ImageBuilderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageBuilderState::Pending => "pending",
            ImageBuilderState::Ready => "ready",
            ImageBuilderState::Broken => "broken",
            ImageBuilderState::Deprecated => "deprecated",
        }
    }
}

impl FromStr for ImageBuilderState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(ImageBuilderState::Pending),
            "ready" => Ok(ImageBuilderState::Ready),
            "broken" => Ok(ImageBuilderState::Broken),
            "deprecated" => Ok(ImageBuilderState::Deprecated),
            other => Err(Error::InvalidState(other.to_string())),
        }
    }
}

impl Display for ImageBuilderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How post-write read-back verification is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMode {
    #[serde(rename = "full-hash")]
    Full,
    #[serde(rename = "prefix-16MiB")]
    Prefix16M,
    #[serde(rename = "prefix-64MiB")]
    Prefix64M,
    #[serde(rename = "skip")]
    Skip,
}

impl VerificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMode::Full => "full-hash",
            VerificationMode::Prefix16M => "prefix-16MiB",
            VerificationMode::Prefix64M => "prefix-64MiB",
            VerificationMode::Skip => "skip",
        }
    }

    /// Number of bytes to read back for an image of `image_size` bytes.
    pub fn verify_bytes(&self, image_size: u64) -> u64 {
        match self {
            VerificationMode::Skip => 0,
            VerificationMode::Full => image_size,
            VerificationMode::Prefix16M => image_size.min(16 * 1024 * 1024),
            VerificationMode::Prefix64M => image_size.min(64 * 1024 * 1024),
        }
    }
}

impl FromStr for VerificationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "full-hash" | "full" => Ok(VerificationMode::Full),
            "prefix-16MiB" | "prefix-16m" => Ok(VerificationMode::Prefix16M),
            "prefix-64MiB" | "prefix-64m" => Ok(VerificationMode::Prefix64M),
            "skip" | "skipped" => Ok(VerificationMode::Skip),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

impl Display for VerificationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of post-write verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationResult {
    Match,
    Mismatch,
    Skipped,
}

impl VerificationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationResult::Match => "match",
            VerificationResult::Mismatch => "mismatch",
            VerificationResult::Skipped => "skipped",
        }
    }
}

impl FromStr for VerificationResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "match" => Ok(VerificationResult::Match),
            "mismatch" => Ok(VerificationResult::Mismatch),
            "skipped" => Ok(VerificationResult::Skipped),
            other => Err(Error::InvalidState(other.to_string())),
        }
    }
}

impl Display for VerificationResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a build output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Sysupgrade,
    Factory,
    Kernel,
    Rootfs,
    Manifest,
    Initramfs,
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Sysupgrade => "sysupgrade",
            ArtifactKind::Factory => "factory",
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::Rootfs => "rootfs",
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::Initramfs => "initramfs",
            ArtifactKind::Other => "other",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "sysupgrade" => Ok(ArtifactKind::Sysupgrade),
            "factory" => Ok(ArtifactKind::Factory),
            "kernel" => Ok(ArtifactKind::Kernel),
            "rootfs" => Ok(ArtifactKind::Rootfs),
            "manifest" => Ok(ArtifactKind::Manifest),
            "initramfs" => Ok(ArtifactKind::Initramfs),
            "other" => Ok(ArtifactKind::Other),
            other => Err(Error::InvalidState(other.to_string())),
        }
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered build output file, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub filename: String,
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub kind: ArtifactKind,
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_mode_bytes() {
        let mib = 1024 * 1024;
        assert_eq!(VerificationMode::Skip.verify_bytes(100 * mib), 0);
        assert_eq!(VerificationMode::Full.verify_bytes(100 * mib), 100 * mib);
        assert_eq!(
            VerificationMode::Prefix16M.verify_bytes(100 * mib),
            16 * mib
        );
        assert_eq!(VerificationMode::Prefix16M.verify_bytes(3 * mib), 3 * mib);
        assert_eq!(
            VerificationMode::Prefix64M.verify_bytes(100 * mib),
            64 * mib
        );
        assert_eq!(VerificationMode::Prefix64M.verify_bytes(0), 0);
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            VerificationMode::Full,
            VerificationMode::Prefix16M,
            VerificationMode::Prefix64M,
            VerificationMode::Skip,
        ] {
            assert_eq!(mode.as_str().parse::<VerificationMode>().unwrap(), mode);
        }
        assert!("bogus".parse::<VerificationMode>().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "succeeded".parse::<BuildStatus>().unwrap(),
            BuildStatus::Succeeded
        );
        assert!(BuildStatus::Succeeded.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!("SUCCEEDED".parse::<BuildStatus>().is_err());
    }
}
