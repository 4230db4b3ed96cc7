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

//! Core of the OpenWrt image generation service: turns declarative device
//! profiles into firmware images through the official Image Builder
//! toolchain, caches builds by a content-addressed key, and writes
//! artifacts to TF/SD cards with hash verification.
//!
//! The CLI, HTTP, and MCP facades are thin layers over the functions
//! re-exported here; everything returns typed results whose error kinds
//! are stable strings shared across all surfaces.

pub mod blockdev;
pub mod build;
pub mod cachekey;
pub mod config;
pub mod db;
pub mod errors;
pub mod flash;
pub mod imagebuilder;
pub mod io;
pub mod lock;
pub mod overlay;
pub mod profile;
pub mod types;
pub mod writer;

pub use crate::blockdev::{validate_device, DeviceInfo, ValidateOptions};
pub use crate::build::{
    build_batch, build_or_reuse, get_build, get_build_artifacts, list_builds, BatchMode,
    BatchSummary, BuildOptions,
};
pub use crate::config::{init_logging, Config};
pub use crate::db::{
    ArtifactRow, BuildRecordRow, Db, FlashQuery, FlashRecordRow, ImageBuilderRow, ProfileRow,
};
pub use crate::errors::{Error, Result};
pub use crate::flash::{
    flash_artifact, flash_image, get_flash_records, plan_flash, FlashOptions, FlashPlan,
    FlashResult,
};
pub use crate::imagebuilder::{
    builder_cache_info, ensure_builder, get_builder, list_builders, prune_builders, CacheInfo,
};
pub use crate::profile::{
    create_profile, delete_profile, get_profile, list_profiles, query_profiles, update_profile,
    FileSpec, Profile, ProfilePolicies, ProfileQuery,
};
pub use crate::types::{
    ArtifactInfo, ArtifactKind, BuildStatus, FlashStatus, ImageBuilderState, VerificationMode,
    VerificationResult,
};
pub use crate::writer::{verify_device_hash, write_image_to_device, WriteResult};
