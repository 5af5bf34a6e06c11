//! Shared protocol logic for both the client driver and the daemon handler
//!
//! This module owns the byte layout of every frame. It performs no I/O.

use crate::error::{FerryError, Result};
use crate::protocol::{
    Command, COUNT_FIELD_LEN, FILENAME_FIELD_LEN, MAX_FILENAME_LEN, SIZE_FIELD_LEN,
};
use std::path::{Component, Path, PathBuf};

/// Encode a filename into the fixed 256-byte field.
///
/// Copies at most 255 bytes and zero-fills the rest. Names longer than that
/// are truncated, not rejected, at the last whole character that fits.
/// Encoding stops at an embedded NUL since the decoder could never see past
/// it.
pub fn encode_filename(name: &str) -> [u8; FILENAME_FIELD_LEN] {
    let mut field = [0u8; FILENAME_FIELD_LEN];
    let logical = name.find('\0').unwrap_or(name.len());
    let mut n = logical.min(MAX_FILENAME_LEN);
    while !name.is_char_boundary(n) {
        n -= 1;
    }
    field[..n].copy_from_slice(&name.as_bytes()[..n]);
    field
}

/// Decode a filename field: the prefix up to the first zero byte.
pub fn decode_filename(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Name as it will appear after a trip through the filename field.
pub fn wire_filename(name: &str) -> String {
    decode_filename(&encode_filename(name))
}

pub fn encode_size(size: u64) -> [u8; SIZE_FIELD_LEN] {
    size.to_ne_bytes()
}

pub fn decode_size(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; SIZE_FIELD_LEN] = bytes.try_into().map_err(|_| FerryError::ShortFrame {
        expected: SIZE_FIELD_LEN,
        received: bytes.len(),
    })?;
    Ok(u64::from_ne_bytes(arr))
}

pub fn encode_count(count: u32) -> [u8; COUNT_FIELD_LEN] {
    count.to_ne_bytes()
}

pub fn decode_count(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; COUNT_FIELD_LEN] = bytes.try_into().map_err(|_| FerryError::ShortFrame {
        expected: COUNT_FIELD_LEN,
        received: bytes.len(),
    })?;
    Ok(u32::from_ne_bytes(arr))
}

/// LIST request: the bare command byte.
pub fn build_list_request() -> [u8; 1] {
    [Command::List.as_byte()]
}

/// PING request: the bare command byte; the reply is the same byte.
pub fn build_ping_request() -> [u8; 1] {
    [Command::Ping.as_byte()]
}

/// GET request: command byte | filename field
pub fn build_get_request(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + FILENAME_FIELD_LEN);
    buf.push(Command::Get.as_byte());
    buf.extend_from_slice(&encode_filename(name));
    buf
}

/// PUT header: command byte | filename field | size. The payload follows.
pub fn build_put_header(name: &str, size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + FILENAME_FIELD_LEN + SIZE_FIELD_LEN);
    buf.push(Command::Put.as_byte());
    buf.extend_from_slice(&encode_filename(name));
    buf.extend_from_slice(&encode_size(size));
    buf
}

/// LIST response: count | filename field * count
pub fn build_list_response(names: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COUNT_FIELD_LEN + names.len() * FILENAME_FIELD_LEN);
    buf.extend_from_slice(&encode_count(names.len() as u32));
    for name in names {
        buf.extend_from_slice(&encode_filename(name));
    }
    buf
}

/// Check that a name addresses a file directly inside the shared directory.
/// Rejects empty names, separators, `.`/`..` and anything with more than one
/// path component.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(FerryError::InvalidFilename(name.to_string()));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(FerryError::InvalidFilename(name.to_string())),
    }
}

/// Join a client-supplied name onto the shared directory, refusing anything
/// that would escape it.
pub fn resolve_in_share(root: &Path, name: &str) -> Result<PathBuf> {
    validate_filename(name)?;
    Ok(root.join(name))
}

/// Base filename of a local path, as sent in a PUT request.
pub fn base_filename(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| FerryError::InvalidFilename(path.display().to_string()))
}
