//! Free disk space probing and threshold classification.

use std::path::{Path, PathBuf};

use sysinfo::Disks;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Reports free space on the filesystem holding a path.
pub trait DiskSpaceProbe: Send + Sync {
    /// Available bytes, or `None` if the filesystem cannot be determined.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by `sysinfo`'s disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let target = resolve(path);
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Canonical form of the nearest existing ancestor of `path`.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute
        .ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or(absolute)
}

/// Outcome of comparing free space against the recording thresholds.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskStatus {
    Ok { available_gb: f64 },
    Warning { available_gb: f64 },
    Critical { available_gb: f64 },
    /// Free space could not be determined
    Unknown,
}

impl DiskStatus {
    pub fn classify(available: Option<u64>, warning_gb: f64, critical_gb: f64) -> Self {
        let Some(bytes) = available else {
            return DiskStatus::Unknown;
        };
        let available_gb = bytes_to_gb(bytes);
        if available_gb < critical_gb {
            DiskStatus::Critical { available_gb }
        } else if available_gb < warning_gb {
            DiskStatus::Warning { available_gb }
        } else {
            DiskStatus::Ok { available_gb }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_classify() {
        assert_eq!(
            DiskStatus::classify(Some(50 * GB), 20.0, 5.0),
            DiskStatus::Ok { available_gb: 50.0 }
        );
        assert_eq!(
            DiskStatus::classify(Some(10 * GB), 20.0, 5.0),
            DiskStatus::Warning { available_gb: 10.0 }
        );
        assert_eq!(
            DiskStatus::classify(Some(GB), 20.0, 5.0),
            DiskStatus::Critical { available_gb: 1.0 }
        );
        assert_eq!(DiskStatus::classify(None, 20.0, 5.0), DiskStatus::Unknown);
    }

    #[test]
    fn test_resolve_missing_path_uses_existing_ancestor() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("a").join("b");
        let resolved = resolve(&missing);
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_system_probe_finds_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        // Some sandboxes expose no disks; only check consistency when one is found
        if let Some(bytes) = SystemDiskProbe.available_bytes(dir.path()) {
            assert!(bytes_to_gb(bytes) >= 0.0);
        }
    }
}
