//! On-disk layout version of a cache directory.
//!
//! A cache directory holds a `version` file naming the layout in use and the store itself
//! under `v<version>/`.

pub const CURRENT_VERSION: u64 = 1;
const VERSION_FILENAME: &str = "version";

fn versioned_path(dir: &std::path::Path, version: u64) -> std::path::PathBuf {
    dir.join(format!("v{version}"))
}

/// Resolves the directory the store for `dir` lives in, creating `dir` and recording the
/// version if needed.
///
/// An unreadable, older or newer version falls back to [`CURRENT_VERSION`].
pub fn versioned_dir(dir: &std::path::Path) -> std::io::Result<std::path::PathBuf> {
    let version_file = dir.join(VERSION_FILENAME);
    match std::fs::read_to_string(&version_file) {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("creating version file {:?}", version_file);
        }
        Err(error) => {
            tracing::warn!(
                "cannot read cache version file {:?}: {}, using version {}",
                version_file,
                error,
                CURRENT_VERSION
            );
        }
        Ok(contents) => match contents.trim().parse::<u64>() {
            Ok(CURRENT_VERSION) => {
                tracing::debug!("loaded cache version {}", CURRENT_VERSION);
                return Ok(versioned_path(dir, CURRENT_VERSION));
            }
            Ok(version) if version < CURRENT_VERSION => {
                tracing::debug!(
                    "cache version {} is old, upgrading to {}",
                    version,
                    CURRENT_VERSION
                );
            }
            Ok(version) => {
                tracing::warn!(
                    "cache version {} is newer than this build understands, using {}",
                    version,
                    CURRENT_VERSION
                );
            }
            Err(error) => {
                tracing::warn!(
                    "cannot parse cache version file {:?}: {}, using version {}",
                    version_file,
                    error,
                    CURRENT_VERSION
                );
            }
        },
    }
    std::fs::create_dir_all(dir)?;
    std::fs::write(&version_file, CURRENT_VERSION.to_string())?;
    Ok(versioned_path(dir, CURRENT_VERSION))
}
