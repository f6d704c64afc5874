//! Free-disk-space checks for the recording target.

use std::path::Path;

use sysinfo::Disks;

/// Free space in GB on the disk holding `path`, if a mount can be matched.
///
/// Matches the longest mount point that prefixes `path`, so `/data/recordings`
/// resolves to `/data` rather than `/`.
pub fn free_space_gb(path: &Path) -> Option<f64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / 1e9)
}

/// Log free space, warning below the configured floor.
pub fn check_free_space(path: &Path, min_free_gb: f64) -> Option<f64> {
    match free_space_gb(path) {
        Some(free) => {
            tracing::info!("Free space on the recording drive: {:.1} GB", free);
            if free < min_free_gb {
                tracing::warn!(
                    "Less than {:.0} GB of free space remaining on the recording drive",
                    min_free_gb
                );
            }
            Some(free)
        }
        None => {
            tracing::warn!("Could not determine free space for {}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_root_paths() {
        // Any absolute path should match at least the root mount.
        let free = free_space_gb(Path::new("/"));
        assert!(free.is_some());
        assert!(free.unwrap() >= 0.0);
    }
}
