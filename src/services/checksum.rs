//! MD5 helpers shared by both pipelines.
//!
//! The platform records part checksums as lowercase hex. The `Content-MD5`
//! header carries the base64 of the raw 16-byte digest.

use base64::{Engine as _, engine::general_purpose};

pub fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// `Content-MD5` header value for `data`.
pub fn content_md5(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(data).0)
}

/// Hex digest carried by a `Content-MD5` header.
///
/// Accepts base64 of the raw digest and, from stores that send it that way,
/// a bare 32-character hex digest. Anything else yields `None`.
pub fn decode_content_md5(value: &str) -> Option<String> {
    let value = value.trim();
    if value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Some(value.to_ascii_lowercase());
    }
    let raw = general_purpose::STANDARD.decode(value).ok()?;
    let digest: [u8; 16] = raw.as_slice().try_into().ok()?;
    Some(format!("{:x}", md5::Digest(digest)))
}

/// Base64 `Content-MD5` value for a hex digest.
pub fn hex_to_content_md5(hex: &str) -> Option<String> {
    let hex = hex.trim();
    if hex.len() != 32 {
        return None;
    }
    let mut raw = [0u8; 16];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(general_purpose::STANDARD.encode(raw))
}
