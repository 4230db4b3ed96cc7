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

//! Image Builder archive fetching: URL discovery, download with inline
//! checksum computation, and extraction with path-traversal guards.

use std::fs::{remove_file, rename, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Url;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::FetchError;
use crate::io::{Sha256Writer, BUFFER_SIZE};

type Result<T> = std::result::Result<T, FetchError>;

/// Timeout for the small sha256sums fetch.
const CHECKSUMS_TIMEOUT: Duration = Duration::from_secs(30);

/// URLs for an Image Builder archive and its checksum file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuilderUrls {
    pub archive_url: String,
    pub sha256sums_url: String,
}

/// Basename of the upstream archive for a (release, target, subtarget)
/// triple.  Snapshots ship zstd, releases ship xz.
pub fn archive_filename(release: &str, target: &str, subtarget: &str) -> String {
    if release.eq_ignore_ascii_case("snapshot") {
        format!("openwrt-imagebuilder-{target}-{subtarget}.Linux-x86_64.tar.zst")
    } else {
        format!("openwrt-imagebuilder-{release}-{target}-{subtarget}.Linux-x86_64.tar.xz")
    }
}

/// Construct the archive and sha256sums URLs under `base_url`.
pub fn imagebuilder_urls(
    release: &str,
    target: &str,
    subtarget: &str,
    base_url: &str,
) -> ImageBuilderUrls {
    let base = base_url.trim_end_matches('/');
    let prefix = if release.eq_ignore_ascii_case("snapshot") {
        format!("{base}/snapshots/targets/{target}/{subtarget}")
    } else {
        format!("{base}/releases/{release}/targets/{target}/{subtarget}")
    };
    ImageBuilderUrls {
        archive_url: format!("{prefix}/{}", archive_filename(release, target, subtarget)),
        sha256sums_url: format!("{prefix}/sha256sums"),
    }
}

/// Find the checksum for `filename` in a sha256sums document.  Lines are
/// `<hex><spaces>[*]<filename>`; comments and blanks are skipped.  The
/// returned checksum is lowercased.
pub fn parse_sha256sums(content: &str, filename: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let checksum = parts.next()?;
        let name = match parts.next() {
            Some(rest) => rest.trim_start().trim_start_matches('*').trim(),
            None => continue,
        };
        if name == filename {
            return Some(checksum.to_ascii_lowercase());
        }
    }
    None
}

fn http_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else if let Some(status) = err.status() {
        FetchError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            err,
        }
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| FetchError::Path(format!("invalid URL {url}: {e}")))
}

/// Fetch the sha256sums document.
pub fn fetch_checksums(client: &Client, url: &str) -> Result<String> {
    debug!(url, "fetching checksums");
    let parsed = parse_url(url)?;
    let resp = client
        .get(parsed)
        .timeout(CHECKSUMS_TIMEOUT)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| http_error(url, e))?;
    resp.text().map_err(|e| http_error(url, e))
}

/// Outcome of a verified archive download.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub checksum: String,
    pub size_bytes: u64,
}

/// Stream `url` into `dest`, computing SHA-256 while writing.  On checksum
/// mismatch the destination is deleted and `verification_error` raised.
pub fn download_archive(
    client: &Client,
    url: &str,
    dest: &Path,
    expected_checksum: Option<&str>,
    timeout: Duration,
) -> Result<DownloadOutcome> {
    info!(url, dest = %dest.display(), "downloading archive");
    let parsed = parse_url(url)?;
    let mut resp = client
        .get(parsed)
        .timeout(timeout)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| http_error(url, e))?;

    let os_err = |context: &str| {
        let context = context.to_string();
        move |err| FetchError::Os { context, err }
    };
    let file = File::create(dest).map_err(os_err(&format!("creating {}", dest.display())))?;
    let mut writer = Sha256Writer::new(BufWriter::with_capacity(BUFFER_SIZE, file));

    let copy_result = std::io::copy(&mut resp, &mut writer);
    if let Err(err) = copy_result {
        let _ = remove_file(dest);
        return Err(FetchError::Os {
            context: format!("downloading {url}"),
            err,
        });
    }
    writer
        .flush()
        .map_err(os_err(&format!("flushing {}", dest.display())))?;
    let (_, checksum, size_bytes) = writer.finish();

    if let Some(expected) = expected_checksum {
        if !checksum.eq_ignore_ascii_case(expected) {
            let _ = remove_file(dest);
            return Err(FetchError::ChecksumMismatch {
                url: url.to_string(),
                expected: expected.to_ascii_lowercase(),
                actual: checksum,
            });
        }
    }

    info!(
        dest = %dest.display(),
        size_bytes,
        checksum = %&checksum[..16],
        "download complete"
    );
    Ok(DownloadOutcome {
        checksum,
        size_bytes,
    })
}

/// Validate a tar member's declared path: relative, no `..` components.
fn validate_member_path(name: &Path) -> Result<()> {
    let bad = name.is_absolute()
        || name
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
    if bad {
        return Err(FetchError::PathTraversal {
            member: name.to_string_lossy().into_owned(),
        });
    }
    Ok(())
}

/// Whether a link target would resolve outside the extraction tree.
/// Relative `..` hops are fine as long as they never climb past the root;
/// absolute targets never are.
fn link_escapes(member: &Path, link: &Path) -> bool {
    if link.is_absolute() {
        return true;
    }
    // depth of the directory containing the member
    let mut depth = member
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count() as i64
        - 1;
    for component in link.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => return true,
        }
    }
    false
}

fn unpack_tar<R: Read>(reader: R, archive_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    let entries = archive.entries().map_err(|err| FetchError::Tar {
        archive: archive_path.to_path_buf(),
        err,
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|err| FetchError::Tar {
            archive: archive_path.to_path_buf(),
            err,
        })?;
        let name = entry
            .path()
            .map_err(|err| FetchError::Tar {
                archive: archive_path.to_path_buf(),
                err,
            })?
            .into_owned();
        validate_member_path(&name)?;
        // Links that point outside the tree are as dangerous as absolute
        // member names.
        if matches!(
            entry.header().entry_type(),
            EntryType::Symlink | EntryType::Link
        ) {
            if let Ok(Some(link)) = entry.link_name() {
                if link_escapes(&name, &link) {
                    return Err(FetchError::PathTraversal {
                        member: name.to_string_lossy().into_owned(),
                    });
                }
            }
        }
        entry.unpack_in(dest).map_err(|err| FetchError::Tar {
            archive: archive_path.to_path_buf(),
            err,
        })?;
    }
    Ok(())
}

/// Extract a `.tar.xz`, `.tar.zst`, or plain `.tar` archive into `dest`
/// and return the extracted Image Builder root directory.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<PathBuf> {
    info!(archive = %archive_path.display(), dest = %dest.display(), "extracting");
    std::fs::create_dir_all(dest).map_err(|err| FetchError::Os {
        context: format!("creating {}", dest.display()),
        err,
    })?;

    let name = archive_path.to_string_lossy().to_ascii_lowercase();
    let file = File::open(archive_path).map_err(|err| FetchError::Os {
        context: format!("opening {}", archive_path.display()),
        err,
    })?;
    let reader = BufReader::with_capacity(BUFFER_SIZE, file);

    if name.ends_with(".tar.xz") {
        unpack_tar(xz2::read::XzDecoder::new(reader), archive_path, dest)?;
    } else if name.ends_with(".tar.zst") {
        let decoder = zstd::stream::read::Decoder::new(reader).map_err(|err| FetchError::Tar {
            archive: archive_path.to_path_buf(),
            err,
        })?;
        unpack_tar(decoder, archive_path, dest)?;
    } else if name.ends_with(".tar") {
        unpack_tar(reader, archive_path, dest)?;
    } else {
        return Err(FetchError::UnsupportedFormat(archive_path.to_path_buf()));
    }

    // The archive is expected to contain a single openwrt-* top-level
    // directory.
    let mut roots: Vec<PathBuf> = std::fs::read_dir(dest)
        .map_err(|err| FetchError::Os {
            context: format!("reading {}", dest.display()),
            err,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("openwrt"))
                    .unwrap_or(false)
        })
        .collect();
    roots.sort();
    let root = match roots.len() {
        0 => dest.to_path_buf(),
        1 => roots.remove(0),
        _ => {
            warn!(
                count = roots.len(),
                "multiple openwrt-* directories after extraction, using the first"
            );
            roots.remove(0)
        }
    };
    info!(root = %root.display(), "extracted Image Builder");
    Ok(root)
}

/// Download and extract one Image Builder into the cache tree, returning
/// the extracted root and the archive checksum.  The archive streams into
/// a `.tmp` sibling first and is removed after extraction.
pub fn download_imagebuilder(
    client: &Client,
    release: &str,
    target: &str,
    subtarget: &str,
    cache_dir: &Path,
    base_url: &str,
    download_timeout: Duration,
) -> Result<(PathBuf, String)> {
    let urls = imagebuilder_urls(release, target, subtarget, base_url);
    let filename = archive_filename(release, target, subtarget);

    let builder_dir = cache_dir.join(release).join(target).join(subtarget);
    std::fs::create_dir_all(&builder_dir).map_err(|err| FetchError::Os {
        context: format!("creating {}", builder_dir.display()),
        err,
    })?;

    // Fetched in the same invocation as the archive so a racing upstream
    // republish surfaces as verification_error rather than silent skew.
    let expected = match fetch_checksums(client, &urls.sha256sums_url) {
        Ok(content) => {
            let checksum = parse_sha256sums(&content, &filename);
            if checksum.is_none() {
                warn!(filename, "no checksum found in sha256sums, proceeding unverified");
            }
            checksum
        }
        Err(e) => {
            warn!(error = %e, "could not fetch sha256sums, proceeding unverified");
            None
        }
    };

    let tmp_path = builder_dir.join(format!("{filename}.tmp"));
    let result = (|| {
        let outcome = download_archive(
            client,
            &urls.archive_url,
            &tmp_path,
            expected.as_deref(),
            download_timeout,
        )?;
        let archive_path = builder_dir.join(&filename);
        rename(&tmp_path, &archive_path).map_err(|err| FetchError::Os {
            context: format!("renaming {}", tmp_path.display()),
            err,
        })?;
        let root = extract_archive(&archive_path, &builder_dir)?;
        let _ = remove_file(&archive_path);
        Ok((root, outcome.checksum))
    })();
    if result.is_err() {
        let _ = remove_file(&tmp_path);
    }
    result
}

/// Remove an extracted builder directory.  Returns false when it did not
/// exist.
pub fn prune_builder_dir(builder_dir: &Path) -> Result<bool> {
    if !builder_dir.exists() {
        return Ok(false);
    }
    info!(dir = %builder_dir.display(), "pruning Image Builder directory");
    std::fs::remove_dir_all(builder_dir).map_err(|err| FetchError::Os {
        context: format!("removing {}", builder_dir.display()),
        err,
    })?;
    Ok(true)
}

/// Total on-disk size of the cache tree.
pub fn cache_size(cache_dir: &Path) -> u64 {
    if !cache_dir.exists() {
        return 0;
    }
    WalkDir::new(cache_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
