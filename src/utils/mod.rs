pub mod logsink;

use anyhow::{Context, Result, anyhow};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Characters that would break out of a single path segment on some
/// platform; they collapse to underscores in on-disk file names derived
/// from server or job names.
const FILENAME_UNSAFE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

pub fn safe_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '\0' {
            continue;
        }
        out.push(if FILENAME_UNSAFE.contains(&c) { '_' } else { c });
    }
    out
}

/// Resolve the patchbay state directory (`$PATCHBAY_HOME` or `~/.patchbay`).
pub fn get_patchbay_home() -> Result<PathBuf> {
    match std::env::var_os("PATCHBAY_HOME") {
        Some(home) => Ok(PathBuf::from(home)),
        None => dirs::home_dir()
            .map(|home| home.join(".patchbay"))
            .ok_or_else(|| anyhow!("could not determine home directory")),
    }
}

/// Write a file atomically: the content lands in a sibling temp file that is
/// fsynced and renamed over the target, so readers observe the old bytes or
/// the new bytes and nothing in between.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    ensure_dir(dir)?;

    let mut builder = tempfile::Builder::new();
    // State files can carry tokens; the temp file is created 0600 so there
    // is no window where another user can read it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o600));
    }
    let mut staged = builder
        .tempfile_in(dir)
        .with_context(|| format!("staging write in {}", dir.display()))?;
    staged.write_all(content.as_bytes())?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_filename_strips_separators() {
        assert_eq!(safe_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(safe_filename("plain-name_1"), "plain-name_1");
        assert_eq!(safe_filename("nul\0byte"), "nulbyte");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/file.json");
        atomic_write(&path, "{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("file.txt");
        atomic_write(&path, "first").unwrap();
        atomic_write(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        atomic_write(&path, "{\"token\":\"x\"}").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_patchbay_home_env_override() {
        // Serialize env mutation within this test only
        unsafe { std::env::set_var("PATCHBAY_HOME", "/tmp/patchbay-test-home") };
        let home = get_patchbay_home().unwrap();
        assert_eq!(home, PathBuf::from("/tmp/patchbay-test-home"));
        unsafe { std::env::remove_var("PATCHBAY_HOME") };
    }
}
