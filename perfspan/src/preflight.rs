//! Pre-flight checks for perfspan
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::debug;
use object::{Object, ObjectSection};
use std::path::Path;

use crate::domain::{LoaderError, Pid};

/// Minimum kernel version: BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Locked memory allowed for maps on kernels that still charge RLIMIT_MEMLOCK
const MEMLOCK_LIMIT: u64 = 128 << 20;

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed requirement.
pub fn run_preflight_checks(binary: &Path, quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(binary)?;
    check_usdt_notes(binary, quiet)?;
    bump_memlock_rlimit()?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    bail!(
        "Permission denied: perfspan requires root privileges to load eBPF programs \
         and open perf events.\n\n\
         Run with: sudo perfspan ..."
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             perfspan requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }
    Ok(())
}

/// Parse `major.minor` out of a release string like `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the target binary exists and is a file
fn check_binary_exists(binary: &Path) -> Result<()> {
    if !binary.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            binary.display()
        );
    }
    if !binary.is_file() {
        bail!(
            "Not a file: {}\n\n\
             BINARY must point to an executable file, not a directory.",
            binary.display()
        );
    }
    Ok(())
}

/// Warn early if the binary carries no USDT notes at all
fn check_usdt_notes(binary: &Path, quiet: bool) -> Result<()> {
    let file_data = std::fs::read(binary)
        .with_context(|| format!("Failed to read binary: {}", binary.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not a valid object file, let later stages handle it
        return Ok(());
    };

    let has_notes = obj.section_by_name(".note.stapsdt").is_some_and(|s| s.size() > 0);
    if !has_notes && !quiet {
        eprintln!(
            "warning: {} has no .note.stapsdt section; was it built with perfspan markers enabled?",
            binary.display()
        );
    }
    Ok(())
}

/// Raise RLIMIT_MEMLOCK for kernels that account map memory against it
fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit { rlim_cur: MEMLOCK_LIMIT, rlim_max: MEMLOCK_LIMIT };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        debug!("setrlimit(RLIMIT_MEMLOCK) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns [`LoaderError::ProcessNotFound`] if `/proc/<pid>` is absent.
pub fn check_process_exists(pid: Pid) -> Result<(), LoaderError> {
    if !process_alive(pid) {
        return Err(LoaderError::ProcessNotFound(pid));
    }
    Ok(())
}

/// Whether `/proc/<pid>` still exists
#[must_use]
pub fn process_alive(pid: Pid) -> bool {
    Path::new(&format!("/proc/{}", pid.0)).exists()
}
