//! Disk-space admission and system memory probes.
//!
//! Nothing is cached: every query re-reads the filesystem so that space
//! consumed by other processes between calls is observed.

use std::io;
use std::path::Path;

use sysinfo::System;
use tracing::debug;

use crate::paths::nearest_existing;

/// Safety margin for filesystem overhead, in percent of the payload.
pub const SPACE_MARGIN_PERCENT: u64 = 5;

/// Bytes that must be free before a payload of `bytes` is admitted.
pub fn required_with_margin(bytes: u64) -> u64 {
    let margin = (u128::from(bytes) * u128::from(SPACE_MARGIN_PERCENT)).div_ceil(100);
    u64::try_from(u128::from(bytes) + margin).unwrap_or(u64::MAX)
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
///
/// The path does not have to exist yet; its nearest existing ancestor is probed.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let probe = nearest_existing(path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no existing ancestor for {}", path.display()),
        )
    })?;
    let available = probe_free_space(&probe)?;
    debug!("Available space at {:?}: {} bytes", probe, available);
    Ok(available)
}

/// Whether `path` has room for `required_bytes` plus the safety margin.
///
/// A probe failure counts as "not enough space".
pub fn has_enough_space(path: &Path, required_bytes: u64) -> bool {
    match available_space(path) {
        Ok(available) => available > required_with_margin(required_bytes),
        Err(e) => {
            debug!("Space probe failed for {:?}: {}", path, e);
            false
        }
    }
}

/// Total physical memory in mebibytes.
pub fn total_memory_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024)
}

#[cfg(unix)]
fn probe_free_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(not(unix))]
fn probe_free_space(path: &Path) -> io::Result<u64> {
    use sysinfo::Disks;

    let target = path.canonicalize()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mounted disk contains {}", target.display()),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_is_five_percent_rounded_up() {
        assert_eq!(required_with_margin(0), 0);
        assert_eq!(required_with_margin(100), 105);
        assert_eq!(required_with_margin(1000), 1050);
        assert_eq!(required_with_margin(1), 2);
        assert_eq!(required_with_margin(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_available_space_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet");
        let direct = available_space(dir.path()).unwrap();
        let via_ancestor = available_space(&missing).unwrap();
        assert!(direct > 0);
        // Same filesystem; allow for concurrent writers.
        assert!(via_ancestor.abs_diff(direct) < 64 * 1024 * 1024);
    }

    #[test]
    fn test_has_enough_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(has_enough_space(dir.path(), 1));
        assert!(!has_enough_space(dir.path(), u64::MAX / 2));
    }

    #[test]
    fn test_total_memory_is_reported() {
        assert!(total_memory_mb() > 0);
    }
}
