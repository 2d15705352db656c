//! Quarantine substitution artifact.
//!
//! When policy allows, quarantined downloads are answered with a generated placeholder image
//! instead of an error. The artifact is deterministic for a given size so repeated requests
//! (and their cache entries) agree byte-for-byte.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};

use crate::error::{RepoError, RepoResult};

/// Content type of the substitution artifact.
pub const QUARANTINE_CONTENT_TYPE: &str = "image/png";

/// Upload name reported for the substitution artifact.
pub const QUARANTINE_UPLOAD_NAME: &str = "quarantine.png";

const BACKGROUND: Rgba<u8> = Rgba([0x2e, 0x2e, 0x2e, 0xff]);
const STRIPE: Rgba<u8> = Rgba([0x8a, 0x8a, 0x8a, 0xff]);
const STRIPE_WIDTH: u32 = 8;

/// Render the substitution artifact at the configured dimensions.
pub fn generate(width: u32, height: u32) -> RepoResult<RgbaImage> {
    if width == 0 || height == 0 {
        return Err(RepoError::internal(
            "quarantine artifact dimensions must be non-zero",
        ));
    }
    // diagonal hatching, visibly a placeholder at any size
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        if ((x + y) / STRIPE_WIDTH) % 2 == 0 {
            BACKGROUND
        } else {
            STRIPE
        }
    }))
}

/// Encode the artifact as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> RepoResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| RepoError::internal(format!("failed to encode quarantine artifact: {e}")))?;
    Ok(out.into_inner())
}
