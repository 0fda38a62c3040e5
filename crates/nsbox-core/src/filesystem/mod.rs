//! Filesystem jail for container isolation.
//!
//! Pivots the child into the minimal-userland tree, mounts a private
//! `/proc` and detaches the host's root so no host path stays reachable.

pub mod jail;
pub mod mount;
pub mod pivot_root;

use std::path::{Path, PathBuf};

use nsbox_common::error::{NsboxError, Result};

pub use jail::{Jail, JailStep, enter};
pub use mount::{MountKind, MountPoint, MountTable};

/// Checks a root filesystem path on the host and returns its canonical form.
///
/// The path must be absolute, exist, be a directory and not be the host's
/// own root.
///
/// # Errors
///
/// Returns [`NsboxError::Config`] describing the first violated condition.
pub fn validate_rootfs(root: &Path) -> Result<PathBuf> {
    if !root.is_absolute() {
        return Err(NsboxError::Config {
            message: format!("rootfs must be an absolute path: {}", root.display()),
        });
    }
    let canonical = root.canonicalize().map_err(|e| NsboxError::Config {
        message: format!("rootfs {} is not accessible: {e}", root.display()),
    })?;
    if !canonical.is_dir() {
        return Err(NsboxError::Config {
            message: format!("rootfs {} is not a directory", canonical.display()),
        });
    }
    if canonical == Path::new("/") {
        return Err(NsboxError::Config {
            message: "rootfs must not be the host root".into(),
        });
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_directory_is_canonicalised() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("payload")).expect("mkdir");
        let indirect = dir.path().join("payload/../payload");

        let root = validate_rootfs(&indirect).expect("valid rootfs");
        assert_eq!(root, dir.path().join("payload").canonicalize().expect("canonical"));
    }

    #[test]
    fn relative_path_is_rejected() {
        assert!(validate_rootfs(Path::new("rootfs")).is_err());
    }

    #[test]
    fn missing_directory_is_rejected() {
        let err = validate_rootfs(Path::new("/nonexistent/nsbox-rootfs")).unwrap_err();
        assert!(err.to_string().contains("not accessible"));
    }

    #[test]
    fn regular_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("rootfs.tar");
        std::fs::write(&file, b"").expect("write");
        assert!(validate_rootfs(&file).is_err());
    }

    #[test]
    fn host_root_is_rejected() {
        let err = validate_rootfs(Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("host root"));
    }
}
