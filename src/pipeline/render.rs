//! Unit rendering: one PDF page → PNG bytes.
//!
//! [`UnitRenderer`] is the seam the orchestrator renders through; tests plug
//! in an in-memory renderer, production uses [`PdfiumRenderer`].
//!
//! pdfium is a blocking C library, so every call runs on
//! `tokio::task::spawn_blocking`. The longest edge is capped at
//! `max_rendered_pixels` whatever the physical page size, keeping memory
//! bounded and images in the range vision models read best (1–2 k px).

use crate::error::{ExtractError, RenderError};
use crate::pipeline::encode;
use futures::future::{BoxFuture, FutureExt};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Produces the visual representation of each unit.
pub trait UnitRenderer: Send + Sync {
    /// Number of units in the input.
    fn unit_count(&self) -> BoxFuture<'_, Result<usize, ExtractError>>;

    /// Render one unit (0-indexed) to image bytes.
    fn render(&self, unit: usize) -> BoxFuture<'_, Result<Vec<u8>, RenderError>>;
}

/// Renders pages of a local PDF through pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    path: PathBuf,
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRenderer {
    pub fn new(
        path: impl Into<PathBuf>,
        dpi: u32,
        max_pixels: u32,
        password: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            dpi,
            max_pixels,
            password,
        }
    }
}

impl UnitRenderer for PdfiumRenderer {
    fn unit_count(&self) -> BoxFuture<'_, Result<usize, ExtractError>> {
        let path = self.path.clone();
        let password = self.password.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                let pdfium = bind_pdfium()?;
                let document = open_document(&pdfium, &path, password.as_deref())?;
                let pages = document.pages().len() as usize;
                info!(pages, path = %path.display(), "PDF loaded");
                Ok(pages)
            })
            .await
            .map_err(|e| ExtractError::Internal(format!("page count task panicked: {e}")))?
        }
        .boxed()
    }

    fn render(&self, unit: usize) -> BoxFuture<'_, Result<Vec<u8>, RenderError>> {
        let path = self.path.clone();
        let password = self.password.clone();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);
        async move {
            tokio::task::spawn_blocking(move || {
                render_blocking(&path, unit, dpi, max_pixels, password.as_deref())
            })
            .await
            .map_err(|e| RenderError {
                unit,
                detail: format!("render task panicked: {e}"),
            })?
        }
        .boxed()
    }
}

fn render_blocking(
    path: &Path,
    unit: usize,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
) -> Result<Vec<u8>, RenderError> {
    let fail = |detail: String| RenderError { unit, detail };

    let pdfium = bind_pdfium().map_err(|e| fail(e.to_string()))?;
    let document = open_document(&pdfium, path, password).map_err(|e| fail(e.to_string()))?;

    let index = u16::try_from(unit).map_err(|_| fail("page index out of range".into()))?;
    let page = document
        .pages()
        .get(index)
        .map_err(|e| fail(format!("{e:?}")))?;

    // Scale to the requested DPI, then cap the longest edge.
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);
    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| fail(format!("{e:?}")))?;

    let image = bitmap.as_image();
    debug!(unit, width = image.width(), height = image.height(), "rendered page");
    encode::png_bytes(&image).map_err(|e| fail(format!("PNG encoding failed: {e}")))
}

/// Bind pdfium from `PDFIUM_LIB_PATH`, the working directory, or the system.
fn bind_pdfium() -> Result<Pdfium, ExtractError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(lib) if !lib.is_empty() => Pdfium::bind_to_library(lib),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    };
    bindings
        .map(Pdfium::new)
        .map_err(|e| ExtractError::PdfiumBindingFailed(format!("{e:?}")))
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, ExtractError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let detail = format!("{e:?}");
        if detail.to_lowercase().contains("password") {
            if password.is_some() {
                ExtractError::CorruptPdf {
                    path: path.to_path_buf(),
                    detail: "incorrect password".into(),
                }
            } else {
                ExtractError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            ExtractError::CorruptPdf {
                path: path.to_path_buf(),
                detail,
            }
        }
    })
}
