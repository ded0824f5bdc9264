//! PDF rasterisation: render uploaded packets to JPEG pages via pdfium.
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts. `tokio::task::spawn_blocking` moves the work onto the
//! blocking thread pool so rendering does not stall the async workers.

use image::codecs::jpeg::JpegEncoder;
use pdfium_render::prelude::*;

use crate::errors::WorkflowError;

/// Rendering tier: cheap review thumbnails or annotation-quality pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderQuality {
    /// ~75 dpi, JPEG quality 60. Shown inline during page review.
    Thumbnail,
    /// ~300 dpi, JPEG quality 95. Backs the annotation canvas and export.
    HighRes,
}

impl RenderQuality {
    /// Target pixel width for a US-letter page at the tier's dpi.
    fn target_width(&self) -> i32 {
        match self {
            Self::Thumbnail => 638,   // 8.5in * 75dpi
            Self::HighRes => 2550,    // 8.5in * 300dpi
        }
    }

    fn jpeg_quality(&self) -> u8 {
        match self {
            Self::Thumbnail => 60,
            Self::HighRes => 95,
        }
    }
}

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page index in the source document.
    pub index: usize,
    pub jpeg: Vec<u8>,
}

/// Rasterise the given pages (all pages when `indices` is `None`) at the
/// requested quality. Out-of-range indices are skipped, matching the
/// forgiving behavior of the selection endpoints.
pub async fn render_pages(
    pdf_bytes: Vec<u8>,
    indices: Option<Vec<usize>>,
    quality: RenderQuality,
) -> Result<Vec<PageImage>, WorkflowError> {
    tokio::task::spawn_blocking(move || render_pages_blocking(&pdf_bytes, indices, quality))
        .await
        .map_err(|e| WorkflowError::RenderFailed {
            detail: format!("render task panicked: {}", e),
        })?
}

fn render_pages_blocking(
    pdf_bytes: &[u8],
    indices: Option<Vec<usize>>,
    quality: RenderQuality,
) -> Result<Vec<PageImage>, WorkflowError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(pdf_bytes, None)
        .map_err(|e| WorkflowError::RenderFailed {
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    let indices = indices.unwrap_or_else(|| (0..total_pages).collect());

    let render_config = PdfRenderConfig::new()
        .set_target_width(quality.target_width())
        .set_maximum_height(quality.target_width() * 2);

    let mut results = Vec::with_capacity(indices.len());
    for idx in indices {
        if idx >= total_pages {
            tracing::warn!(page = idx, total = total_pages, "skipping out-of-range page");
            continue;
        }

        let page = pages
            .get(idx as u16)
            .map_err(|e| WorkflowError::RenderFailed {
                detail: format!("page {}: {:?}", idx, e),
            })?;
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| WorkflowError::RenderFailed {
                    detail: format!("page {}: {:?}", idx, e),
                })?;

        let jpeg = encode_jpeg(&bitmap.as_image(), quality.jpeg_quality()).map_err(|e| {
            WorkflowError::RenderFailed {
                detail: format!("page {} JPEG encode: {}", idx, e),
            }
        })?;
        tracing::debug!(page = idx, bytes = jpeg.len(), "rendered page");
        results.push(PageImage { index: idx, jpeg });
    }

    Ok(results)
}

fn encode_jpeg(img: &image::DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    // Pdfium hands back RGBA; JPEG has no alpha channel.
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(buf)
}
