//! Pre-write guards: per-device free-space checks and the max-times fuse.
//!
//! The disk guard runs once over the whole target set before any file is
//! opened, grouping targets by the device their parent directory lives on,
//! and once more per target immediately before its open. On platforms
//! without statvfs the guard degrades to a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::target::Target;

/// Free space headroom demanded beyond the expected write volume.
pub const MARGIN: u64 = 16 * 1024 * 1024;

/// Errors produced by the pre-write guards. All map to exit code 3.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A device would be filled past its margin.
    #[error(
        "insufficient space on the device holding {}: {free} bytes free, \
         {needed} bytes needed (margin included)",
        .path.display()
    )]
    DiskFull {
        /// A target on the offending device.
        path: PathBuf,
        /// Bytes currently free.
        free: u64,
        /// Expected bytes plus margin.
        needed: u64,
    },
    /// The effective times exceed the configured fuse.
    #[error("effective times {times} exceed --max-times {max_times}")]
    MaxTimes {
        /// The count the job would run with.
        times: u64,
        /// The configured ceiling.
        max_times: u64,
    },
    /// A target's parent directory could not be inspected.
    #[error("cannot stat {}: {source}", .path.display())]
    Stat {
        /// The offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Abort before any open when `times` exceeds the fuse.
///
/// # Errors
///
/// [`Error::MaxTimes`] on breach.
pub fn check_max_times(times: Option<u64>, max_times: Option<u64>) -> Result<(), Error> {
    if let (Some(times), Some(max_times)) = (times, max_times) {
        if times > max_times {
            return Err(Error::MaxTimes { times, max_times });
        }
    }
    Ok(())
}

/// Check every device backing the target set for `expected + MARGIN` bytes
/// of free space. Stdout targets are exempt.
///
/// # Errors
///
/// [`Error::DiskFull`] when a device falls short, [`Error::Stat`] when a
/// parent directory cannot be inspected.
pub fn check_disk(targets: &[(Target, u64)]) -> Result<(), Error> {
    let mut per_device: HashMap<u64, (PathBuf, u64)> = HashMap::new();
    for (target, expected) in targets {
        let Some(path) = target.path() else {
            continue;
        };
        let probe = probe_dir(path);
        let device = match device_id(&probe) {
            Ok(device) => device,
            Err(source) => {
                return Err(Error::Stat {
                    path: probe,
                    source,
                })
            }
        };
        let entry = per_device.entry(device).or_insert_with(|| (probe, 0));
        entry.1 += expected;
    }

    for (probe, expected) in per_device.values() {
        check_one(probe, *expected)?;
    }
    Ok(())
}

/// The per-target re-check, run immediately before opening `path`.
///
/// # Errors
///
/// [`Error::DiskFull`] when the device falls short.
pub fn recheck_target(path: &Path, expected: u64) -> Result<(), Error> {
    check_one(&probe_dir(path), expected)
}

fn check_one(probe: &Path, expected: u64) -> Result<(), Error> {
    let needed = expected.saturating_add(MARGIN);
    match free_space(probe) {
        Some(free) if free < needed => Err(Error::DiskFull {
            path: probe.to_path_buf(),
            free,
            needed,
        }),
        Some(free) => {
            debug!(probe = %probe.display(), free, needed, "disk guard satisfied");
            Ok(())
        }
        None => {
            warn!(
                probe = %probe.display(),
                "free space unavailable on this platform; disk guard skipped"
            );
            Ok(())
        }
    }
}

/// The existing directory whose device a target will land on.
fn probe_dir(path: &Path) -> PathBuf {
    let mut probe = path.parent().unwrap_or_else(|| Path::new("."));
    if probe.as_os_str().is_empty() {
        probe = Path::new(".");
    }
    let mut current = probe.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent.to_path_buf(),
            _ => return PathBuf::from("."),
        }
    }
    current
}

#[cfg(unix)]
fn device_id(probe: &Path) -> Result<u64, std::io::Error> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(probe)?.dev())
}

#[cfg(not(unix))]
fn device_id(probe: &Path) -> Result<u64, std::io::Error> {
    // No grouping on this platform; every probe is its own device.
    let _ = std::fs::metadata(probe)?;
    Ok(0)
}

#[cfg(unix)]
fn free_space(probe: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(probe).ok()?;
    #[allow(clippy::useless_conversion)]
    Some(u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()))
}

#[cfg(not(unix))]
fn free_space(_probe: &Path) -> Option<u64> {
    None
}

/// Resident set size of this process in bytes, `None` where the facility is
/// unavailable.
#[must_use]
pub fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_times_fuse_trips() {
        assert!(check_max_times(Some(10), Some(5)).is_err());
        assert!(check_max_times(Some(5), Some(5)).is_ok());
        assert!(check_max_times(Some(10), None).is_ok());
        assert!(check_max_times(None, Some(5)).is_ok());
    }

    #[test]
    fn modest_expectations_pass_on_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::File(dir.path().join("out.bin"));
        check_disk(&[(target, 1)]).unwrap();
    }

    #[test]
    fn absurd_expectations_fail_on_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::File(dir.path().join("out.bin"));
        let err = check_disk(&[(target, u64::MAX / 2)]).unwrap_err();
        assert!(matches!(err, Error::DiskFull { .. }));
    }

    #[test]
    fn stdout_targets_are_exempt() {
        check_disk(&[(Target::Stdout, u64::MAX / 2)]).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_reads_on_linux() {
        let rss = rss_bytes().unwrap();
        assert!(rss > 0);
    }
}
