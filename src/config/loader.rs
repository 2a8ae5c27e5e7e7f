use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::path::PathBuf;

#[allow(unused_imports)]
use tracing::warn;

use super::paths::Paths;
use super::schema::Profile;
use crate::utils::safe_filename;

pub fn profile_path(paths: &Paths, name: &str) -> PathBuf {
    paths
        .profiles_dir()
        .join(format!("{}.json", safe_filename(name)))
}

/// Load a profile definition from `profiles/<name>.json`.
///
/// Profile files are written by the CLI/configuration collaborator; patchbay
/// only reads them. A missing file for the `default` profile yields an empty
/// profile so a fresh install can start and report zero servers; any other
/// missing profile is an error.
pub fn load_profile(paths: &Paths, name: &str) -> Result<Profile> {
    let path = profile_path(paths, name);

    if !path.exists() {
        if name == "default" {
            return Ok(Profile {
                name: name.to_string(),
                ..Profile::default()
            });
        }
        anyhow::bail!("profile '{}' not found at {}", name, path.display());
    }

    // Shared (read) lock — allows concurrent readers, blocks during writes
    let file = fs::File::open(&path)
        .with_context(|| format!("Failed to open profile at {}", path.display()))?;
    file.lock_shared()
        .with_context(|| "Failed to acquire shared lock on profile file")?;

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read profile from {}", path.display()))?;
    // Lock released when `file` drops at end of scope

    let mut profile: Profile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse profile JSON from {}", path.display()))?;
    profile.name = name.to_string();

    profile
        .validate()
        .with_context(|| "Profile validation failed")?;

    check_file_permissions(&path);

    Ok(profile)
}

/// Warn if the profile file has overly permissive permissions (unix only).
#[cfg(unix)]
fn check_file_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "profile file {} has permissions {:o} — recommend 0600",
                path.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(not(unix))]
fn check_file_permissions(_path: &std::path::Path) {}
