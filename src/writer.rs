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

//! Streaming image writer with read-back verification.
//!
//! Writes are flushed and fsynced before verification; a hash mismatch on
//! read-back is the signal that the medium is defective or performed a
//! ghost write, and is always surfaced.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::Path;

use tracing::{debug, error, info};

use crate::errors::WriteError;
use crate::io::{copy_n, sha256_file, sha256_reader, BUFFER_SIZE};
use crate::types::{VerificationMode, VerificationResult};

type Result<T> = std::result::Result<T, WriteError>;

/// Bytes zeroed at the start of the device by a wipe.
pub const WIPE_BYTES: u64 = 1024 * 1024;

/// Result of a write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub success: bool,
    pub bytes_written: u64,
    pub source_hash: String,
    pub device_hash: Option<String>,
    pub verification_mode: VerificationMode,
    pub verification_result: VerificationResult,
}

fn open_device_rw(device_path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)
        .map_err(|err| match err.kind() {
            ErrorKind::PermissionDenied => WriteError::PermissionDenied {
                device: device_path.to_string(),
                err,
            },
            _ => WriteError::Io {
                device: device_path.to_string(),
                err,
            },
        })
}

fn device_io(device_path: &str) -> impl Fn(std::io::Error) -> WriteError + '_ {
    move |err| match err.kind() {
        ErrorKind::PermissionDenied => WriteError::PermissionDenied {
            device: device_path.to_string(),
            err,
        },
        _ => WriteError::Io {
            device: device_path.to_string(),
            err,
        },
    }
}

/// SHA-256 of the first `num_bytes` bytes read back from a device.
pub fn compute_device_hash(device_path: &str, num_bytes: u64) -> Result<String> {
    let file = File::open(device_path).map_err(device_io(device_path))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let (hash, read) = sha256_reader(&mut reader, Some(num_bytes)).map_err(device_io(device_path))?;
    debug!(device = %device_path, num_bytes, read, "computed device hash");
    Ok(hash)
}

/// Zero the first [`WIPE_BYTES`] of the device, flushing and syncing.
/// Clears stale filesystem and partition signatures.
pub fn wipe_device(device_path: &str) -> Result<u64> {
    info!(device = %device_path, bytes = WIPE_BYTES, "wiping start of device");
    let mut device = open_device_rw(device_path)?;
    let zeroes = vec![0u8; BUFFER_SIZE];
    let mut remaining = WIPE_BYTES;
    while remaining > 0 {
        let chunk = remaining.min(zeroes.len() as u64) as usize;
        device
            .write_all(&zeroes[..chunk])
            .map_err(device_io(device_path))?;
        remaining -= chunk as u64;
    }
    device.flush().map_err(device_io(device_path))?;
    device.sync_all().map_err(device_io(device_path))?;
    Ok(WIPE_BYTES)
}

/// Write an image file to a block device and verify the write by reading
/// it back.
///
/// `expected_hash` short-circuits the source hash computation when the
/// caller already hashed the image at the same verification granularity.
pub fn write_image_to_device(
    image_path: &Path,
    device_path: &str,
    wipe_before: bool,
    verification_mode: VerificationMode,
    expected_hash: Option<&str>,
) -> Result<WriteResult> {
    if !image_path.exists() {
        return Err(WriteError::ImageNotFound(image_path.to_path_buf()));
    }
    let image_size = image_path
        .metadata()
        .map_err(|err| WriteError::Io {
            device: image_path.display().to_string(),
            err,
        })?
        .len();
    let verify_bytes = verification_mode.verify_bytes(image_size);
    info!(
        image = %image_path.display(),
        device = %device_path,
        image_size,
        mode = %verification_mode,
        "writing image"
    );

    let source_hash = match expected_hash {
        Some(hash) => hash.to_string(),
        None if verification_mode != VerificationMode::Skip => {
            let limit = (verify_bytes < image_size).then_some(verify_bytes);
            let (hash, _) = sha256_file(image_path, limit).map_err(|err| WriteError::Io {
                device: image_path.display().to_string(),
                err,
            })?;
            hash
        }
        None => String::new(),
    };

    if wipe_before {
        wipe_device(device_path)?;
    }

    let image = File::open(image_path).map_err(|err| WriteError::Io {
        device: image_path.display().to_string(),
        err,
    })?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, image);
    let mut device = open_device_rw(device_path)?;

    let mut buf = vec![0u8; BUFFER_SIZE];
    let bytes_written = copy_n(&mut reader, &mut device, image_size, &mut buf)
        .map_err(device_io(device_path))?;
    device.flush().map_err(device_io(device_path))?;
    device.sync_all().map_err(device_io(device_path))?;
    drop(device);
    // Push everything else (directory entries, other dirty pages) out too
    // before we read back through the device.
    nix::unistd::sync();
    info!(device = %device_path, bytes_written, "write complete");

    let mut verification_result = VerificationResult::Skipped;
    let mut device_hash = None;
    if verification_mode != VerificationMode::Skip {
        info!(device = %device_path, verify_bytes, mode = %verification_mode, "verifying write");
        let hash = compute_device_hash(device_path, verify_bytes)?;
        if hash == source_hash {
            verification_result = VerificationResult::Match;
            info!(device = %device_path, "hash verification passed");
        } else {
            error!(
                device = %device_path,
                expected = %source_hash,
                actual = %hash,
                "hash verification FAILED"
            );
            return Err(WriteError::HashMismatch {
                device: device_path.to_string(),
                expected: source_hash,
                actual: hash,
                mode: verification_mode.as_str().to_string(),
            });
        }
        device_hash = Some(hash);
    }

    Ok(WriteResult {
        success: true,
        bytes_written,
        source_hash,
        device_hash,
        verification_mode,
        verification_result,
    })
}

/// Verify that a device still carries expected content, without writing.
pub fn verify_device_hash(
    device_path: &str,
    expected_hash: &str,
    num_bytes: u64,
) -> Result<(bool, String)> {
    info!(device = %device_path, num_bytes, "verifying device against expected hash");
    let actual = compute_device_hash(device_path, num_bytes)?;
    let matches = actual == expected_hash;
    if !matches {
        error!(device = %device_path, expected = %expected_hash, actual = %actual, "hash mismatch");
    }
    Ok((matches, actual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    // The write path is exercised against regular files standing in for
    // devices; the block-device-specific guards live in blockdev.

    fn image_with(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_image_not_found() {
        let dir = TempDir::new().unwrap();
        let err = write_image_to_device(
            &dir.path().join("missing.img"),
            "/dev/null",
            false,
            VerificationMode::Skip,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "IMAGE_NOT_FOUND");
    }

    #[test]
    fn test_write_round_trip_full_verification() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let image = image_with(&dir, "image.img", &data);
        let device = dir.path().join("device");
        write(&device, vec![0xffu8; data.len()]).unwrap();

        let result = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            false,
            VerificationMode::Full,
            None,
        )
        .unwrap();
        assert!(result.success);
        assert_eq!(result.bytes_written, data.len() as u64);
        assert_eq!(result.verification_result, VerificationResult::Match);
        assert_eq!(result.device_hash.as_deref(), Some(result.source_hash.as_str()));

        // re-read and compare byte-for-byte
        assert_eq!(std::fs::read(&device).unwrap()[..data.len()], data[..]);
    }

    #[test]
    fn test_write_skip_verification() {
        let dir = TempDir::new().unwrap();
        let image = image_with(&dir, "image.img", &[7u8; 4096]);
        let device = dir.path().join("device");
        write(&device, [0u8; 4096]).unwrap();

        let result = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            false,
            VerificationMode::Skip,
            None,
        )
        .unwrap();
        assert_eq!(result.verification_result, VerificationResult::Skipped);
        assert!(result.device_hash.is_none());
        assert!(result.source_hash.is_empty());
    }

    #[test]
    fn test_prefix_verification_bounded_by_image_size() {
        let dir = TempDir::new().unwrap();
        let data = vec![3u8; 2 * 1024 * 1024];
        let image = image_with(&dir, "image.img", &data);
        let device = dir.path().join("device");
        write(&device, vec![0u8; data.len()]).unwrap();

        // 16 MiB prefix on a 2 MiB image verifies the whole image
        let result = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            false,
            VerificationMode::Prefix16M,
            None,
        )
        .unwrap();
        assert_eq!(result.verification_result, VerificationResult::Match);
        let (full_hash, _) = sha256_file(&image, None).unwrap();
        assert_eq!(result.source_hash, full_hash);
    }

    #[test]
    fn test_ghost_write_detected() {
        let dir = TempDir::new().unwrap();
        let image = image_with(&dir, "image.img", &[9u8; 8192]);
        let device = dir.path().join("device");
        write(&device, [0u8; 8192]).unwrap();

        // lie about the source hash to simulate a device that returns
        // different bytes than were written
        let err = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            false,
            VerificationMode::Full,
            Some(&"0".repeat(64)),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "HASH_MISMATCH");
        match err {
            WriteError::HashMismatch { expected, actual, mode, .. } => {
                assert_eq!(expected, "0".repeat(64));
                assert_eq!(actual.len(), 64);
                assert_eq!(mode, "full-hash");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wipe_device_zeroes_first_mib() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("device");
        write(&device, vec![0xaau8; 2 * 1024 * 1024]).unwrap();

        let wiped = wipe_device(device.to_str().unwrap()).unwrap();
        assert_eq!(wiped, WIPE_BYTES);
        let content = std::fs::read(&device).unwrap();
        assert!(content[..WIPE_BYTES as usize].iter().all(|&b| b == 0));
        // bytes past the wipe window are untouched
        assert!(content[WIPE_BYTES as usize..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_wipe_before_write_then_overwrite() {
        let dir = TempDir::new().unwrap();
        let data = vec![5u8; 4096];
        let image = image_with(&dir, "image.img", &data);
        let device = dir.path().join("device");
        write(&device, vec![0xaau8; 2 * 1024 * 1024]).unwrap();

        let result = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            true,
            VerificationMode::Full,
            None,
        )
        .unwrap();
        assert_eq!(result.verification_result, VerificationResult::Match);
        let content = std::fs::read(&device).unwrap();
        assert_eq!(&content[..4096], &data[..]);
        // wiped region beyond the image is zero
        assert!(content[4096..WIPE_BYTES as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_verify_device_hash_standalone() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("device");
        let data = b"verified content".repeat(100);
        write(&device, &data).unwrap();
        let (expected, _) = sha256_file(&device, Some(256)).unwrap();

        let (ok, actual) =
            verify_device_hash(device.to_str().unwrap(), &expected, 256).unwrap();
        assert!(ok);
        assert_eq!(actual, expected);

        let (ok, _) =
            verify_device_hash(device.to_str().unwrap(), &"f".repeat(64), 256).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_permission_denied_classified() {
        let dir = TempDir::new().unwrap();
        let image = image_with(&dir, "image.img", &[1u8; 4096]);
        let device = dir.path().join("device");
        write(&device, [0u8; 4096]).unwrap();
        let mut perms = device.metadata().unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o400);
        std::fs::set_permissions(&device, perms).unwrap();

        // root bypasses permission bits; only meaningful unprivileged
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let err = write_image_to_device(
            &image,
            device.to_str().unwrap(),
            false,
            VerificationMode::Skip,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "WRITE_PERMISSION_DENIED");
    }
}
