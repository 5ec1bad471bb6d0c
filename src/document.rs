//! Document-side data model: documents, pages, detected regions and crops.
//!
//! A [`Document`] is immutable once created; ingestion derives [`Page`]s from
//! it, the layout detector attaches [`DetectedElement`]s to each page, and
//! the crop stage turns visual elements into [`VisualAsset`]s.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::PdfRagError;

/// An uploaded PDF: identifier plus the raw bytes pages are rendered from.
///
/// Cloning is cheap; the bytes are shared.
#[derive(Clone)]
pub struct Document {
    id: String,
    bytes: Arc<[u8]>,
    password: Option<String>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("bytes", &self.bytes.len())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Document {
    /// Wrap PDF bytes, validating the `%PDF` magic.
    pub fn from_bytes(id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<Self, PdfRagError> {
        let id = id.into();
        let bytes: Vec<u8> = bytes.into();
        if id.trim().is_empty() {
            return Err(PdfRagError::InvalidInput { input: id });
        }
        if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
            let mut magic = [0u8; 4];
            let n = bytes.len().min(4);
            magic[..n].copy_from_slice(&bytes[..n]);
            return Err(PdfRagError::NotAPdf {
                source_name: id,
                magic,
            });
        }
        Ok(Self {
            id,
            bytes: Arc::from(bytes),
            password: None,
        })
    }

    /// Attach the user password for encrypted documents.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The shared byte buffer; clones of a document return the same one.
    pub(crate) fn shared_bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

/// A rendered page with the elements detected on it.
#[derive(Debug, Clone)]
pub struct Page {
    /// Zero-based page index.
    pub index: usize,
    /// Raster image the layout detector and crop stage work from.
    pub image: DynamicImage,
    /// Embedded text layer (empty for scanned pages).
    pub text: String,
    /// Regions found by the layout detector.
    pub elements: Vec<DetectedElement>,
}

impl Page {
    /// Tables, charts and figures, in reading order.
    pub fn visual_elements(&self) -> impl Iterator<Item = &DetectedElement> {
        self.elements.iter().filter(|e| e.kind.is_visual())
    }

    /// Text to index: the text layer, or the text read from text-block
    /// regions when the page has none (scans).
    pub fn indexable_text(&self) -> String {
        if !self.text.trim().is_empty() {
            return self.text.clone();
        }
        self.elements
            .iter()
            .filter(|e| e.kind == ElementKind::TextBlock)
            .filter_map(|e| e.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Region classification returned by the layout detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Table,
    Chart,
    Figure,
    TextBlock,
}

impl ElementKind {
    /// Every kind that produces a cropped visual.
    pub const VISUAL: [ElementKind; 3] = [ElementKind::Table, ElementKind::Chart, ElementKind::Figure];

    pub fn is_visual(self) -> bool {
        !matches!(self, ElementKind::TextBlock)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Table => "table",
            ElementKind::Chart => "chart",
            ElementKind::Figure => "figure",
            ElementKind::TextBlock => "text_block",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = String;

    /// Accepts the canonical names plus the synonyms vision models tend to use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "table" | "tables" | "tabular" => Ok(ElementKind::Table),
            "chart" | "charts" | "graph" | "plot" | "bar_chart" | "line_chart" | "pie_chart" => {
                Ok(ElementKind::Chart)
            }
            "figure" | "figures" | "image" | "picture" | "diagram" | "photo" | "illustration" => {
                Ok(ElementKind::Figure)
            }
            "text_block" | "text" | "paragraph" | "textblock" | "title" | "heading" => {
                Ok(ElementKind::TextBlock)
            }
            other => Err(format!("unknown element kind '{other}'")),
        }
    }
}

/// Axis-aligned region in normalised page coordinates (`[0,1] × [0,1]`,
/// origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Build a box, rejecting anything outside the unit square or degenerate.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Result<Self, String> {
        let coords = [x0, y0, x1, y1];
        if coords.iter().any(|c| !c.is_finite() || *c < 0.0 || *c > 1.0) {
            return Err(format!(
                "coordinates [{x0}, {y0}, {x1}, {y1}] fall outside the page"
            ));
        }
        if x1 <= x0 || y1 <= y0 {
            return Err(format!("degenerate region [{x0}, {y0}, {x1}, {y1}]"));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Area of the intersection with `other` (0 when disjoint).
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        w * h
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Pixel rectangle `(x, y, width, height)` inside a `width × height`
    /// image. Always at least 1×1 and never past the image edge.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let px = |v: f32, max: u32| ((v * max as f32).round() as u32).min(max);
        let x = px(self.x0, width).min(width.saturating_sub(1));
        let y = px(self.y0, height).min(height.saturating_sub(1));
        let x_end = px(self.x1, width).max(x + 1).min(width.max(1));
        let y_end = px(self.y1, height).max(y + 1).min(height.max(1));
        (x, y, (x_end - x).max(1), (y_end - y).max(1))
    }
}

/// A region found on a page by the layout detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    /// Stable identifier: `{document_id}:p{page}:e{n}`.
    pub id: String,
    pub kind: ElementKind,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Zero-based index of the owning page.
    pub page_index: usize,
    /// Title or heading the model read for the region, if any.
    pub title: Option<String>,
    /// Transcribed text, returned for text blocks.
    pub text: Option<String>,
}

/// A cropped visual region, optionally with reconstructed table markup.
#[derive(Clone, Serialize, Deserialize)]
pub struct VisualAsset {
    pub element_id: String,
    pub kind: ElementKind,
    pub page_index: usize,
    /// PNG-encoded crop.
    #[serde(skip)]
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Structured markup for tables; `None` when structuring was skipped or failed.
    pub structured_content: Option<String>,
    /// Best-effort description for charts and figures.
    pub caption: Option<String>,
    /// Title carried over from detection.
    pub title: Option<String>,
    pub confidence: f32,
}

impl fmt::Debug for VisualAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisualAsset")
            .field("element_id", &self.element_id)
            .field("kind", &self.kind)
            .field("page_index", &self.page_index)
            .field("png", &format_args!("{} bytes", self.png.len()))
            .field("size", &(self.width, self.height))
            .field("structured_content", &self.structured_content.is_some())
            .field("caption", &self.caption.is_some())
            .field("title", &self.title)
            .finish()
    }
}

impl VisualAsset {
    /// Text the visual record is embedded from: title, caption and markup.
    pub fn descriptor(&self) -> String {
        let mut parts = vec![format!("{} on page {}", self.kind, self.page_index + 1)];
        if let Some(t) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(t.trim().to_string());
        }
        if let Some(c) = self.caption.as_deref().filter(|c| !c.trim().is_empty()) {
            parts.push(c.trim().to_string());
        }
        if let Some(m) = self.structured_content.as_deref().filter(|m| !m.trim().is_empty()) {
            parts.push(m.trim().to_string());
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_rejects_non_pdf_bytes() {
        let err = Document::from_bytes("doc", b"PK\x03\x04zip".to_vec()).unwrap_err();
        match err {
            PdfRagError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(Document::from_bytes("doc", b"%PDF-1.7".to_vec()).is_ok());
        assert!(Document::from_bytes("  ", b"%PDF-1.7".to_vec()).is_err());
    }

    #[test]
    fn element_kind_parses_synonyms() {
        assert_eq!("Bar Chart".parse::<ElementKind>().unwrap(), ElementKind::Chart);
        assert_eq!("diagram".parse::<ElementKind>().unwrap(), ElementKind::Figure);
        assert_eq!("text-block".parse::<ElementKind>().unwrap(), ElementKind::TextBlock);
        assert!("sidebar".parse::<ElementKind>().is_err());
    }

    #[test]
    fn bbox_must_lie_inside_unit_square() {
        assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_ok());
        assert!(BoundingBox::new(-0.1, 0.0, 0.5, 0.5).is_err());
        assert!(BoundingBox::new(0.2, 0.2, 1.2, 0.5).is_err());
        assert!(BoundingBox::new(0.5, 0.5, 0.5, 0.9).is_err());
    }

    #[test]
    fn scanned_page_falls_back_to_text_block_regions() {
        let element = |n: usize, kind: ElementKind, text: Option<&str>| DetectedElement {
            id: format!("doc:p0:e{n}"),
            kind,
            bbox: BoundingBox::new(0.1, 0.1 * n as f32, 0.9, 0.1 * n as f32 + 0.05).unwrap(),
            confidence: 0.9,
            page_index: 0,
            title: None,
            text: text.map(str::to_string),
        };
        let mut page = Page {
            index: 0,
            image: DynamicImage::new_rgb8(4, 4),
            text: "  ".into(),
            elements: vec![
                element(1, ElementKind::TextBlock, Some("Growth slowed.")),
                element(2, ElementKind::Table, None),
                element(3, ElementKind::TextBlock, Some("Prices eased.")),
            ],
        };
        assert_eq!(page.indexable_text(), "Growth slowed.\n\nPrices eased.");
        assert_eq!(page.visual_elements().count(), 1);

        page.text = "Embedded text layer.".into();
        assert_eq!(page.indexable_text(), "Embedded text layer.");
    }

    #[test]
    fn bbox_iou() {
        let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5).unwrap();
        let b = BoundingBox::new(0.25, 0.0, 0.75, 0.5).unwrap();
        let iou = a.iou(&b);
        assert!((iou - 1.0 / 3.0).abs() < 1e-5, "iou = {iou}");
        let c = BoundingBox::new(0.6, 0.6, 0.9, 0.9).unwrap();
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn bbox_to_pixels_stays_inside_image() {
        let full = BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        assert_eq!(full.to_pixels(200, 100), (0, 0, 200, 100));

        let sliver = BoundingBox::new(0.999, 0.999, 1.0, 1.0).unwrap();
        let (x, y, w, h) = sliver.to_pixels(200, 100);
        assert!(x + w <= 200 && y + h <= 100);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn descriptor_includes_title_caption_and_markup() {
        let asset = VisualAsset {
            element_id: "d:p0:e0".into(),
            kind: ElementKind::Table,
            page_index: 0,
            png: vec![],
            width: 10,
            height: 10,
            structured_content: Some("| GDP | 2.1 |".into()),
            caption: None,
            title: Some("Key indicators".into()),
            confidence: 0.9,
        };
        let d = asset.descriptor();
        assert!(d.starts_with("table on page 1"));
        assert!(d.contains("Key indicators"));
        assert!(d.contains("| GDP | 2.1 |"));
    }
}
