//! Directory and permission bookkeeping shared by `Publisher::open` and
//! `Subscriber::open`. The exclusive `flock` on `sync.lck` itself lives in
//! `semaphore::OffsetSemaphore::open_server` — the original source's
//! `sync_server` owns both the lock and the semaphore set, and we keep that
//! pairing rather than splitting it across two modules.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::{Error, Result};

/// Creates the queue directory (and parents) with owner-only permissions if
/// it doesn't exist yet; otherwise leaves an existing directory untouched.
pub fn ensure_queue_dir(root: &Path) -> Result<()> {
    match fs::create_dir_all(root) {
        Ok(()) => {
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(root, perms)?;
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Rejects a queue directory that's missing entirely or group/world
/// readable or writable. Called by `Subscriber::open`, which never creates
/// the directory itself.
pub fn check_owner_only_dir(root: &Path) -> Result<()> {
    let metadata = fs::metadata(root).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::from(err)
        }
    })?;
    if !metadata.is_dir() {
        return Err(Error::InvalidArgument("queue path is not a directory"));
    }
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(Error::PermissionDenied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_queue_dir_creates_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let queue = dir.path().join("q");
        ensure_queue_dir(&queue).unwrap();
        let mode = fs::metadata(&queue).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        check_owner_only_dir(&queue).unwrap();
    }

    #[test]
    fn check_owner_only_dir_on_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(check_owner_only_dir(&missing), Err(Error::NotFound)));
    }
}
