//! MIME type detection for inline images

use base64::Engine;

/// Guess MIME by inspecting bytes (magic numbers)
pub fn guess_mime_from_bytes(bytes: &[u8]) -> Option<String> {
    infer::get(bytes).map(|k| k.mime_type().to_string())
}

/// Sniff an image MIME type from base64 data, tolerating a `data:` URL prefix.
/// Only the first few hundred bytes are decoded.
pub fn sniff_base64_image(data: &str) -> Option<String> {
    if let Some(rest) = data.strip_prefix("data:") {
        let (mime, _) = rest.split_once(';')?;
        return Some(mime.to_string());
    }
    let head: String = data.chars().take(512).collect();
    let head = &head[..head.len() - head.len() % 4];
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(head)
        .ok()?;
    guess_mime_from_bytes(&bytes).filter(|m| m.starts_with("image/"))
}

/// Remove a `data:<mime>;base64,` prefix if present.
pub fn strip_data_url(data: &str) -> &str {
    match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    }
}
