//! Filesystem helpers for directories and files that hold key material.

use std::{
    fs::{self, File, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
};

/// Creates `dir` with mode `0o700` if missing; warns (but does not fail)
/// if it already exists with looser permissions.
pub fn ensure_dir_exists(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => {
            fs::set_permissions(dir, Permissions::from_mode(0o700))?;
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => warn_on_dangerous_mode(dir),
        Err(e) => Err(e),
    }
}

/// Logs a warning if `path` is group- or world-accessible.
pub fn warn_on_dangerous_mode(path: &Path) -> io::Result<()> {
    let metadata = File::open(path)?.metadata()?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        log::warn!(
            "{} is accessible to other users (mode {:#05o})",
            path.display(),
            mode
        );
    }
    Ok(())
}

/// Sets `file`'s mode to `new_mode`, returning whether a change was made.
pub fn chmod(file: &File, new_mode: u32) -> io::Result<bool> {
    let metadata = file.metadata()?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode() & 0o777;
    if mode == new_mode {
        return Ok(false);
    }
    permissions.set_mode(new_mode);
    file.set_permissions(permissions)?;
    Ok(true)
}
