//! QR code rendering for the pairing flow.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, Luma};
use qrcode::QrCode;

use crate::error::QrRenderError;

pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Pure function from a pairing code to an encoded image.
pub trait QrRenderer: Send + Sync {
    /// Render `code` as a PNG, base64 encoded (standard alphabet).
    fn render_png_base64(&self, code: &str) -> Result<String, QrRenderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PngQrRenderer {
    /// Pixels per QR module.
    pub scale: u32,
}

impl Default for PngQrRenderer {
    fn default() -> Self {
        Self { scale: 6 }
    }
}

impl QrRenderer for PngQrRenderer {
    fn render_png_base64(&self, code: &str) -> Result<String, QrRenderError> {
        let qr = QrCode::new(code.as_bytes())?;
        let img = qr
            .render::<Luma<u8>>()
            .module_dimensions(self.scale, self.scale)
            .build();
        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, ImageFormat::Png)?;
        Ok(STANDARD.encode(png.into_inner()))
    }
}

pub fn data_url(base64_png: &str) -> String {
    format!("{DATA_URL_PREFIX}{base64_png}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_png() {
        let b64 = PngQrRenderer::default().render_png_base64("1@ABC").unwrap();
        assert!(!b64.is_empty());
        let bytes = STANDARD.decode(&b64).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

        let url = data_url(&b64);
        assert!(url.starts_with("data:image/png;base64,"));
        assert!(url.len() > DATA_URL_PREFIX.len());
    }

    #[test]
    fn test_oversized_code_fails() {
        let huge = "x".repeat(8000);
        assert!(matches!(
            PngQrRenderer::default().render_png_base64(&huge),
            Err(QrRenderError::Encode(_))
        ));
    }
}
