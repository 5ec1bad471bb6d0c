//! Crop & structure: visual elements → [`VisualAsset`]s.
//!
//! Every visual element is cropped from the page raster. Tables then get a
//! second vision call that rebuilds them as pipe-table markup; charts and
//! figures may get a short caption. Both extra calls fail soft: the crop is
//! kept either way, a failed table pass is reported as a degradation and a
//! failed caption is only logged.

use crate::document::{DetectedElement, ElementKind, VisualAsset};
use crate::error::PageError;
use crate::inference::{InferenceRequest, InferenceTask, RateLimitedClient};
use crate::output::DegradeReason;
use crate::pipeline::encode::{encode_png, EncodedImage};
use crate::pipeline::postprocess::{clean_caption, clean_table_markup};
use crate::prompts::{CAPTION_PROMPT, STRUCTURE_TABLE_PROMPT};
use image::DynamicImage;
use tracing::{debug, warn};

/// A crop plus the degradation it caused, if any.
#[derive(Debug, Clone)]
pub struct CropOutcome {
    pub asset: VisualAsset,
    pub degraded: Option<DegradeReason>,
}

/// Crops visual regions and runs the optional structuring/caption passes.
#[derive(Clone)]
pub struct Cropper {
    client: RateLimitedClient,
    structure_tables: bool,
    caption_visuals: bool,
}

impl Cropper {
    pub fn new(client: RateLimitedClient, structure_tables: bool, caption_visuals: bool) -> Self {
        Self {
            client,
            structure_tables,
            caption_visuals,
        }
    }

    /// Crop `element` out of `page`.
    ///
    /// `Err` only when the crop itself cannot be encoded.
    pub async fn crop(
        &self,
        page: &DynamicImage,
        element: &DetectedElement,
    ) -> Result<CropOutcome, PageError> {
        let encoded = crop_region(page, element)?;
        let mut degraded = None;
        let mut structured_content = None;
        let mut caption = None;

        match element.kind {
            ElementKind::Table if self.structure_tables => match self.structure(&encoded).await {
                Ok(markup) => structured_content = Some(markup),
                Err(detail) => {
                    warn!("{}: table kept without markup: {}", element.id, detail);
                    degraded = Some(DegradeReason::TableUnstructured {
                        element_id: element.id.clone(),
                        detail,
                    });
                }
            },
            ElementKind::Chart | ElementKind::Figure if self.caption_visuals => {
                caption = self.caption(&encoded, element).await;
            }
            _ => {}
        }

        debug!(
            "{}: cropped {}x{} ({} markup, {} caption)",
            element.id,
            encoded.width,
            encoded.height,
            if structured_content.is_some() { "with" } else { "no" },
            if caption.is_some() { "with" } else { "no" },
        );

        Ok(CropOutcome {
            asset: VisualAsset {
                element_id: element.id.clone(),
                kind: element.kind,
                page_index: element.page_index,
                png: encoded.png,
                width: encoded.width,
                height: encoded.height,
                structured_content,
                caption,
                title: element.title.clone(),
                confidence: element.confidence,
            },
            degraded,
        })
    }

    async fn structure(&self, crop: &EncodedImage) -> Result<String, String> {
        let request = InferenceRequest::vision(
            InferenceTask::StructureTable,
            STRUCTURE_TABLE_PROMPT,
            "Reconstruct this table.",
            crop.clone(),
        );
        let raw = self.client.complete(&request).await.map_err(|e| e.to_string())?;
        clean_table_markup(&raw).ok_or_else(|| "response contained no table".to_string())
    }

    async fn caption(&self, crop: &EncodedImage, element: &DetectedElement) -> Option<String> {
        let request = InferenceRequest::vision(
            InferenceTask::Caption,
            CAPTION_PROMPT,
            format!("This {} was cropped from a PDF page.", element.kind),
            crop.clone(),
        );
        match self.client.complete(&request).await {
            Ok(raw) => clean_caption(&raw),
            Err(e) => {
                warn!("{}: caption skipped: {}", element.id, e);
                None
            }
        }
    }
}

/// Cut the element's region out of the page and PNG-encode it.
pub fn crop_region(page: &DynamicImage, element: &DetectedElement) -> Result<EncodedImage, PageError> {
    let (x, y, w, h) = element.bbox.to_pixels(page.width(), page.height());
    let region = page.crop_imm(x, y, w, h);
    encode_png(&region).map_err(|e| PageError::RenderFailed {
        page: element.page_index,
        detail: format!("encoding crop {} failed: {e}", element.id),
    })
}
