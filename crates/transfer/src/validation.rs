use std::path::{Component, Path};

use crate::TransferError;

/// Validates a file name announced by a remote sender before it is joined
/// onto a local directory.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Any `..` component
/// - Windows prefix components (`C:`, `\\server`)
/// - NUL bytes
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "NUL byte in file name: {name:?}"
        )));
    }
    if name.starts_with("\\\\") || name.as_bytes().get(1) == Some(&b':') {
        return Err(TransferError::InvalidPath(format!(
            "drive or UNC prefix not allowed: {name}"
        )));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
        }
    }
    if normal == 0 {
        return Err(TransferError::InvalidPath(format!("no file name in: {name}")));
    }

    Ok(())
}
