//! Image encoding: `DynamicImage` → PNG bytes + base64 for the vision API.
//!
//! PNG is lossless; JPEG artefacts on rendered text confuse vision models,
//! and table cells are the smallest text they have to read. The raw PNG is
//! kept as well because crops are stored as assets.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// A PNG-encoded image, ready both for storage and for a request body.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub png: Vec<u8>,
    pub base64: String,
    pub width: u32,
    pub height: u32,
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedImage")
            .field("png", &format_args!("{} bytes", self.png.len()))
            .field("size", &(self.width, self.height))
            .finish()
    }
}

impl EncodedImage {
    pub const MIME: &'static str = "image/png";

    /// Provider attachment. `detail: "high"` keeps small print legible on
    /// tiling models.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.base64.clone(), Self::MIME).with_detail("high")
    }
}

/// Encode an image as PNG + base64.
pub fn encode_png(img: &DynamicImage) -> Result<EncodedImage, image::ImageError> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;

    let base64 = STANDARD.encode(&png);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        base64.len()
    );

    Ok(EncodedImage {
        png,
        base64,
        width: img.width(),
        height: img.height(),
    })
}
