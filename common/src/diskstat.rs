/// Free and total capacity of the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct DiskLimits {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub available_files: u64,
    pub total_files: u64,
}

/// Queries the filesystem containing `path`. Counts are those available to unprivileged users.
#[allow(clippy::unnecessary_cast)]
pub fn disk_limits(path: &std::path::Path) -> std::io::Result<DiskLimits> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let fragment = stat.fragment_size() as u64;
    Ok(DiskLimits {
        available_bytes: (stat.blocks_available() as u64).saturating_mul(fragment),
        total_bytes: (stat.blocks() as u64).saturating_mul(fragment),
        available_files: stat.files_available() as u64,
        total_files: stat.files() as u64,
    })
}
