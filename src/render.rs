//! In-process rendering surface.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};

use crate::error::{Error, Result};
use crate::runtime::ImageResult;

/// What a render call did with an [`ImageResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Raw pixels were written.
    Raster { width: u32, height: u32 },
    /// An encoded image was decoded and drawn.
    Decoded { width: u32, height: u32 },
    /// Nothing could be drawn.
    Unrecognized,
}

/// A 2D canvas holding the most recent frame.
#[derive(Debug, Default)]
pub struct Canvas {
    frame: Option<RgbaImage>,
}

impl Canvas {
    #[must_use]
    pub const fn new() -> Self {
        Self { frame: None }
    }

    /// Current canvas size, `(0, 0)` before anything was drawn.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.frame.as_ref().map_or((0, 0), RgbaImage::dimensions)
    }

    #[must_use]
    pub const fn frame(&self) -> Option<&RgbaImage> {
        self.frame.as_ref()
    }

    /// Writes raw RGBA pixels, resizing the canvas to `width` x `height`.
    ///
    /// # Errors
    ///
    /// Returns an error when `pixels` is not exactly `width * height * 4` bytes.
    pub fn put_image_data(&mut self, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
        let len = pixels.len();
        let frame = RgbaImage::from_raw(width, height, pixels).filter(|_| {
            u64::from(width) * u64::from(height) * 4 == len as u64
        });
        let Some(frame) = frame else {
            return Err(Error::Generation(format!(
                "raster of {len} bytes does not match {width}x{height} RGBA"
            )));
        };
        self.frame = Some(frame);
        Ok(())
    }

    /// Decodes an encoded image and draws it, resizing the canvas to fit.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a supported image format.
    pub fn draw_image(&mut self, encoded: &[u8]) -> Result<(u32, u32)> {
        let decoded = image::load_from_memory(encoded)?.to_rgba8();
        let dims = decoded.dimensions();
        self.frame = Some(decoded);
        Ok(dims)
    }

    /// Draws whatever shape the runtime returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a raster has the wrong size or an encoded image
    /// cannot be decoded.
    pub fn render(&mut self, result: ImageResult) -> Result<RenderOutcome> {
        match result {
            ImageResult::Raster {
                bytes,
                width,
                height,
            } => {
                self.put_image_data(width, height, bytes)?;
                Ok(RenderOutcome::Raster { width, height })
            }
            ImageResult::EncodedImage { bytes } => {
                let (width, height) = self.draw_image(&bytes)?;
                Ok(RenderOutcome::Decoded { width, height })
            }
            ImageResult::Unknown => Ok(RenderOutcome::Unrecognized),
        }
    }

    /// Encodes the current frame as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error if PNG encoding fails.
    pub fn to_png(&self) -> Result<Option<Vec<u8>>> {
        let Some(frame) = &self.frame else {
            return Ok(None);
        };
        let mut out = Cursor::new(Vec::new());
        frame.write_to(&mut out, ImageFormat::Png)?;
        Ok(Some(out.into_inner()))
    }
}
