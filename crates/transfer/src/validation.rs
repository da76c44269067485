use std::path::{Component, Path};

use crate::TransferError;

/// Length of a hex-encoded MD5 fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = 32;

/// Validates that a file name is a single plain path component.
///
/// The name becomes a key in the server's filename index, so it must not
/// name a directory or escape the index root.
///
/// Rejects:
/// - Empty names
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - `.` and `..`
/// - Names containing a path separator
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidName(format!(
            "path separators not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) => Err(TransferError::InvalidName(format!(
            "parent directory traversal not allowed: {name}"
        ))),
        (Some(Component::Prefix(_)), _) => Err(TransferError::InvalidName(format!(
            "path prefix not allowed: {name}"
        ))),
        _ => Err(TransferError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}

/// Validates a fingerprint: exactly [`FINGERPRINT_HEX_LEN`] lowercase hex digits.
///
/// The hash names a directory on the server, so anything else is refused.
pub fn validate_file_hash(hash: &str) -> Result<(), TransferError> {
    if hash.len() != FINGERPRINT_HEX_LEN {
        return Err(TransferError::InvalidHash(format!(
            "expected {FINGERPRINT_HEX_LEN} hex digits, got {}",
            hash.len()
        )));
    }
    if !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TransferError::InvalidHash(format!(
            "not lowercase hex: {hash}"
        )));
    }
    Ok(())
}
