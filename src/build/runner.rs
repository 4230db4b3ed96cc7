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

//! Build runner: composes and executes the external Image Builder
//! invocation, streaming merged stdout/stderr into a log file and
//! enforcing a timeout.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, info};

use crate::errors::RunnerError;
use crate::profile::Profile;

type Result<T> = std::result::Result<T, RunnerError>;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const MAKE_INFO_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one runner invocation.
#[derive(Debug)]
pub struct BuildRun {
    pub success: bool,
    pub exit_code: i32,
    pub bin_dir: PathBuf,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub command: String,
}

/// Knobs for one invocation.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub files_dir: Option<PathBuf>,
    pub extra_packages: Vec<String>,
    pub extra_image_name: Option<String>,
    pub timeout: Option<Duration>,
    /// Program to invoke; `make` unless a test harness substitutes a stub.
    pub make_program: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Compose the PACKAGES value: profile packages plus build-time extras,
/// removals filtered out and re-added with a `-` prefix.  Order-preserving
/// and duplicate-free.
pub fn compose_packages_arg(
    packages: &[String],
    packages_remove: &[String],
    extra_packages: &[String],
) -> String {
    let mut parts: Vec<String> = Vec::new();
    for pkg in packages.iter().chain(extra_packages) {
        if !parts.contains(pkg) {
            parts.push(pkg.clone());
        }
    }
    for pkg in packages_remove {
        parts.retain(|p| p != pkg);
        let removal = format!("-{pkg}");
        if !parts.contains(&removal) {
            parts.push(removal);
        }
    }
    parts.join(" ")
}

/// Compose the full `make image` argument vector.  Argument order is part
/// of the external contract.
pub fn compose_make_command(
    profile: &Profile,
    bin_dir: &Path,
    files_dir: Option<&Path>,
    extra_packages: &[String],
    extra_image_name: Option<&str>,
) -> Vec<String> {
    let mut cmd = vec!["image".to_string()];

    cmd.push(format!("PROFILE={}", profile.imagebuilder_profile));

    let packages = compose_packages_arg(&profile.packages, &profile.packages_remove, extra_packages);
    if !packages.is_empty() {
        cmd.push(format!("PACKAGES={packages}"));
    }

    if let Some(files) = files_dir {
        if files.exists() {
            cmd.push(format!("FILES={}", files.display()));
        }
    }

    cmd.push(format!("BIN_DIR={}", bin_dir.display()));

    let effective_extra_name = extra_image_name.or(profile.extra_image_name.as_deref());
    if let Some(name) = effective_extra_name {
        cmd.push(format!("EXTRA_IMAGE_NAME={name}"));
    }

    if !profile.disabled_services.is_empty() {
        cmd.push(format!(
            "DISABLED_SERVICES={}",
            profile.disabled_services.join(" ")
        ));
    }

    if let Some(size) = profile.rootfs_partsize {
        cmd.push(format!("ROOTFS_PARTSIZE={size}"));
    }

    if profile.add_local_key == Some(true) {
        cmd.push("ADD_LOCAL_KEY=1".to_string());
    }

    cmd
}

/// Whether a directory looks like an extracted Image Builder root.
pub fn validate_imagebuilder_root(root_dir: &Path) -> bool {
    root_dir.is_dir()
        && root_dir.join("Makefile").exists()
        && root_dir.join("target").is_dir()
        && root_dir.join("packages").is_dir()
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Wait for a child with a deadline, killing it on expiry.  Returns the
/// exit code, or None on timeout.
fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<i32>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
        }
        sleep(WAIT_POLL_INTERVAL);
    }
}

/// Execute one Image Builder build.  The pre-flight root check must have
/// passed already.  Returns Ok with `success=false` for a non-zero exit;
/// spawn failures and timeouts are errors.
pub fn run_build(
    profile: &Profile,
    imagebuilder_root: &Path,
    build_dir: &Path,
    options: &RunOptions,
) -> Result<BuildRun> {
    create_dir_all(build_dir).map_err(RunnerError::Execution)?;
    let bin_dir = build_dir.join("bin");
    create_dir_all(&bin_dir).map_err(RunnerError::Execution)?;
    let log_path = build_dir.join("build.log");

    let args = compose_make_command(
        profile,
        &bin_dir,
        options.files_dir.as_deref(),
        &options.extra_packages,
        options.extra_image_name.as_deref(),
    );
    let program = options
        .make_program
        .clone()
        .unwrap_or_else(|| PathBuf::from("make"));
    let command = std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    info!(command = %command, cwd = %imagebuilder_root.display(), "executing build");

    let started_at = Utc::now();
    let mut log = File::create(&log_path).map_err(RunnerError::Execution)?;
    writeln!(log, "# Command: {command}").map_err(RunnerError::Execution)?;
    writeln!(log, "# Started: {}", ts(started_at)).map_err(RunnerError::Execution)?;
    writeln!(log, "# CWD: {}", imagebuilder_root.display()).map_err(RunnerError::Execution)?;
    writeln!(log, "# {}\n", "=".repeat(70)).map_err(RunnerError::Execution)?;
    log.flush().map_err(RunnerError::Execution)?;

    let stdout_log = log.try_clone().map_err(RunnerError::Execution)?;
    let stderr_log = log.try_clone().map_err(RunnerError::Execution)?;
    let mut child = Command::new(&program)
        .args(&args)
        .current_dir(imagebuilder_root)
        .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
        .map_err(RunnerError::Execution)?;

    let exit_code = match wait_with_timeout(&mut child, options.timeout)
        .map_err(RunnerError::Execution)?
    {
        Some(code) => code,
        None => {
            let seconds = options.timeout.map(|t| t.as_secs()).unwrap_or(0);
            let mut log = OpenOptions::new()
                .append(true)
                .open(&log_path)
                .map_err(RunnerError::Execution)?;
            let _ = writeln!(log, "\n# TIMEOUT after {seconds} seconds");
            error!(log = %log_path.display(), seconds, "build timed out");
            return Err(RunnerError::BuildTimeout {
                seconds,
                log_path: Some(log_path),
            });
        }
    };

    let finished_at = Utc::now();
    let duration = (finished_at - started_at)
        .to_std()
        .unwrap_or_default()
        .as_secs_f64();
    let mut log = OpenOptions::new()
        .append(true)
        .open(&log_path)
        .map_err(RunnerError::Execution)?;
    writeln!(log, "\n# Finished: {}", ts(finished_at)).map_err(RunnerError::Execution)?;
    writeln!(log, "# Exit code: {exit_code}").map_err(RunnerError::Execution)?;
    writeln!(log, "# Duration: {duration:.1}s").map_err(RunnerError::Execution)?;

    let success = exit_code == 0;
    if !success {
        error!(exit_code, log = %log_path.display(), "build failed");
    }
    Ok(BuildRun {
        success,
        exit_code,
        bin_dir,
        log_path,
        started_at,
        finished_at,
        command,
    })
}

/// Parsed output of `make info`.
#[derive(Debug, Clone)]
pub struct MakeInfo {
    pub raw_output: String,
    pub profiles: Vec<String>,
}

/// Run `make info` in the builder root and extract the profile names.
pub fn get_make_info(imagebuilder_root: &Path, make_program: Option<&Path>) -> Result<MakeInfo> {
    if !validate_imagebuilder_root(imagebuilder_root) {
        return Err(RunnerError::InvalidImageBuilder(
            imagebuilder_root.to_path_buf(),
        ));
    }
    let program = make_program.unwrap_or(Path::new("make"));
    let mut child = Command::new(program)
        .arg("info")
        .current_dir(imagebuilder_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(RunnerError::Execution)?;

    // Drain the pipes on reader threads; `make info` output can exceed the
    // pipe buffer and deadlock a wait-then-read sequence.
    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_thread = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout_pipe.read_to_string(&mut buf);
        buf
    });
    let stderr_thread = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf);
        buf
    });

    let exit_code = match wait_with_timeout(&mut child, Some(MAKE_INFO_TIMEOUT))
        .map_err(RunnerError::Execution)?
    {
        Some(code) => code,
        None => {
            return Err(RunnerError::InfoTimeout {
                seconds: MAKE_INFO_TIMEOUT.as_secs(),
            })
        }
    };
    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    if exit_code != 0 {
        return Err(RunnerError::MakeInfo {
            exit_code,
            stderr: stderr.trim().to_string(),
        });
    }

    let mut profiles = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim_end();
        if trimmed.ends_with(':') && !trimmed.starts_with(' ') && !trimmed.starts_with('\t') {
            let name = trimmed.trim_end_matches(':');
            if name != "Packages" && name != "Default Packages" {
                profiles.push(name.to_string());
            }
        }
    }
    Ok(MakeInfo {
        raw_output: stdout,
        profiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn minimal_profile() -> Profile {
        Profile::new("t1", "dev", "23.05.3", "ath79", "generic", "archer-c7")
    }

    /// Create a fixture dir that passes the Image Builder root pre-flight
    /// and contains an executable stub in place of `make`.
    fn stub_root(script_body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        write(dir.path().join("Makefile"), b"all:\n").unwrap();
        create_dir_all(dir.path().join("target")).unwrap();
        create_dir_all(dir.path().join("packages")).unwrap();
        let stub = dir.path().join("fake-make");
        write(&stub, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        let mut perms = stub.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&stub, perms).unwrap();
        (dir, stub)
    }

    #[test]
    fn test_compose_packages_arg() {
        let packages = vec!["luci".to_string(), "ppp".to_string()];
        let remove = vec!["ppp".to_string(), "dnsmasq".to_string()];
        let extra = vec!["tcpdump".to_string(), "luci".to_string()];
        assert_eq!(
            compose_packages_arg(&packages, &remove, &extra),
            "luci tcpdump -ppp -dnsmasq"
        );
        assert_eq!(compose_packages_arg(&[], &[], &[]), "");
    }

    #[test]
    fn test_compose_minimal_command() {
        let profile = minimal_profile();
        let cmd = compose_make_command(&profile, Path::new("/b/bin"), None, &[], None);
        assert_eq!(
            cmd,
            vec![
                "image".to_string(),
                "PROFILE=archer-c7".to_string(),
                "BIN_DIR=/b/bin".to_string(),
            ]
        );
    }

    #[test]
    fn test_compose_full_command_order() {
        let staging = TempDir::new().unwrap();
        let mut profile = minimal_profile();
        profile.packages = vec!["luci".to_string()];
        profile.disabled_services = vec!["dnsmasq".to_string(), "odhcpd".to_string()];
        profile.rootfs_partsize = Some(256);
        profile.add_local_key = Some(true);
        profile.extra_image_name = Some("fleet".to_string());

        let cmd = compose_make_command(
            &profile,
            Path::new("/b/bin"),
            Some(staging.path()),
            &[],
            None,
        );
        assert_eq!(
            cmd,
            vec![
                "image".to_string(),
                "PROFILE=archer-c7".to_string(),
                "PACKAGES=luci".to_string(),
                format!("FILES={}", staging.path().display()),
                "BIN_DIR=/b/bin".to_string(),
                "EXTRA_IMAGE_NAME=fleet".to_string(),
                "DISABLED_SERVICES=dnsmasq odhcpd".to_string(),
                "ROOTFS_PARTSIZE=256".to_string(),
                "ADD_LOCAL_KEY=1".to_string(),
            ]
        );
    }

    #[test]
    fn test_extra_image_name_override_wins() {
        let mut profile = minimal_profile();
        profile.extra_image_name = Some("from-profile".to_string());
        let cmd = compose_make_command(&profile, Path::new("/b"), None, &[], Some("override"));
        assert!(cmd.contains(&"EXTRA_IMAGE_NAME=override".to_string()));
    }

    #[test]
    fn test_add_local_key_never_emitted_when_false() {
        let mut profile = minimal_profile();
        profile.add_local_key = Some(false);
        let cmd = compose_make_command(&profile, Path::new("/b"), None, &[], None);
        assert!(!cmd.iter().any(|a| a.starts_with("ADD_LOCAL_KEY")));
    }

    #[test]
    fn test_missing_files_dir_omitted() {
        let profile = minimal_profile();
        let cmd = compose_make_command(
            &profile,
            Path::new("/b"),
            Some(Path::new("/definitely/not/there")),
            &[],
            None,
        );
        assert!(!cmd.iter().any(|a| a.starts_with("FILES=")));
    }

    #[test]
    fn test_validate_imagebuilder_root() {
        let dir = TempDir::new().unwrap();
        assert!(!validate_imagebuilder_root(dir.path()));
        write(dir.path().join("Makefile"), b"").unwrap();
        assert!(!validate_imagebuilder_root(dir.path()));
        create_dir_all(dir.path().join("target")).unwrap();
        create_dir_all(dir.path().join("packages")).unwrap();
        assert!(validate_imagebuilder_root(dir.path()));
        assert!(!validate_imagebuilder_root(&dir.path().join("missing")));
    }

    #[test]
    fn test_run_build_success_writes_log() {
        let (root, stub) = stub_root("echo building; echo err-line >&2; exit 0");
        let build = TempDir::new().unwrap();
        let profile = minimal_profile();

        let run = run_build(
            &profile,
            root.path(),
            build.path(),
            &RunOptions {
                make_program: Some(stub),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(run.success);
        assert_eq!(run.exit_code, 0);
        assert!(run.bin_dir.ends_with("bin"));

        let log = std::fs::read_to_string(&run.log_path).unwrap();
        assert!(log.starts_with("# Command: "));
        assert!(log.contains("image PROFILE=archer-c7"));
        assert!(log.contains("# Started: "));
        assert!(log.contains(&format!("# CWD: {}", root.path().display())));
        // stdout and stderr are merged into the same log
        assert!(log.contains("building"));
        assert!(log.contains("err-line"));
        assert!(log.contains("# Exit code: 0"));
        assert!(log.contains("# Duration: "));
    }

    #[test]
    fn test_run_build_nonzero_exit() {
        let (root, stub) = stub_root("echo exploding; exit 3");
        let build = TempDir::new().unwrap();
        let run = run_build(
            &minimal_profile(),
            root.path(),
            build.path(),
            &RunOptions {
                make_program: Some(stub),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!run.success);
        assert_eq!(run.exit_code, 3);
        let log = std::fs::read_to_string(&run.log_path).unwrap();
        assert!(log.contains("# Exit code: 3"));
    }

    #[test]
    fn test_run_build_timeout_kills_and_annotates_log() {
        let (root, stub) = stub_root("sleep 30");
        let build = TempDir::new().unwrap();
        let err = run_build(
            &minimal_profile(),
            root.path(),
            build.path(),
            &RunOptions {
                make_program: Some(stub),
                timeout: Some(Duration::from_millis(300)),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "build_timeout");
        let log_path = err.log_path().expect("timeout carries the log path");
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("# TIMEOUT after"));
    }

    #[test]
    fn test_run_build_spawn_failure() {
        let root = TempDir::new().unwrap();
        let build = TempDir::new().unwrap();
        let err = run_build(
            &minimal_profile(),
            root.path(),
            build.path(),
            &RunOptions {
                make_program: Some(PathBuf::from("/nonexistent/make")),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "execution_error");
    }

    #[test]
    fn test_get_make_info_parses_profiles() {
        let (root, stub) = stub_root(
            "cat <<'EOF'\nCurrent Target: \"ath79/generic\"\nDefault Packages:\n  base-files\narcher-c7-v2:\n  TP-Link Archer C7 v2\nwndr3700:\n  Netgear WNDR3700\nEOF",
        );
        let info = get_make_info(root.path(), Some(&stub)).unwrap();
        assert_eq!(
            info.profiles,
            vec!["archer-c7-v2".to_string(), "wndr3700".to_string()]
        );
        assert!(info.raw_output.contains("Current Target"));
    }

    #[test]
    fn test_get_make_info_failure() {
        let (root, stub) = stub_root("echo broken >&2; exit 2");
        let err = get_make_info(root.path(), Some(&stub)).unwrap_err();
        assert_eq!(err.kind(), "make_info_error");
        match err {
            RunnerError::MakeInfo { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_get_make_info_rejects_invalid_root() {
        let dir = TempDir::new().unwrap();
        let err = get_make_info(dir.path(), None).unwrap_err();
        assert_eq!(err.kind(), "invalid_imagebuilder");
    }
}
