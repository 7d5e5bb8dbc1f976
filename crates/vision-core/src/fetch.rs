//! Image acquisition: fetch raw bytes from an `http(s)://` URI or a local
//! filesystem path, decode to RGB, and hash on failure for diagnostics.

use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use vision_common::VisionError;

/// Timeout for remote image fetches, per the external-interfaces contract.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FetchError> for VisionError {
    fn from(err: FetchError) -> Self {
        VisionError::Fetch(err.to_string())
    }
}

/// Fetch raw image bytes from `uri`. `http://` and `https://` URIs are
/// fetched with a 5 s timeout; anything else is treated as a local path.
pub async fn fetch_image_bytes(uri: &str) -> Result<Vec<u8>, VisionError> {
    fetch_image_bytes_inner(uri).await.map_err(VisionError::from)
}

async fn fetch_image_bytes_inner(uri: &str) -> Result<Vec<u8>, FetchError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let response = client
            .get(uri)
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    } else {
        let bytes = tokio::fs::read(uri).await?;
        Ok(bytes)
    }
}

/// Decode arbitrary image bytes into RGB8. Format is sniffed from content.
pub fn decode_image(bytes: &[u8]) -> Result<image::RgbImage, VisionError> {
    image::load_from_memory(bytes)
        .map(|dyn_img| dyn_img.to_rgb8())
        .map_err(|e| VisionError::Decode(e.to_string()))
}

/// SHA-256 of raw bytes, hex-encoded. Retained on decode failure so a caller
/// can correlate the bad asset without storing the bytes themselves.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_deterministic_and_hex() {
        let a = sha256_hex(b"hello");
        let b = sha256_hex(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn decode_image_rejects_garbage() {
        let result = decode_image(b"not an image");
        assert!(result.is_err());
    }

    #[test]
    fn decode_image_accepts_png() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(buf.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (4, 4));
    }
}
