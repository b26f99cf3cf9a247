//! Turns an arbitrary drawing into the 28x28 white-on-black format the
//! classifier was trained on.
//!
//! The pipeline mirrors how MNIST digits were prepared: binarize, shrink the
//! drawing into a 20x20 box, surround it with a 4 pixel border, then invert so
//! the strokes are bright on a dark background.

use image::imageops::{self, FilterType};
use image::io::{Limits, Reader};
use image::{DynamicImage, GenericImageView, GrayImage, ImageError, Luma};
use std::io::Cursor;

/// Luma values below this are strokes, everything else is background
pub const THRESHOLD: u8 = 200;

/// Side of the box the drawing is scaled into
pub const DIGIT_SIZE: u32 = 20;

/// Side of the final image
pub const CANVAS_SIZE: u32 = 28;

/// Border around the digit box. `2 * MARGIN + DIGIT_SIZE == CANVAS_SIZE`
pub const MARGIN: u32 = 4;

/// Largest width or height accepted from a client. Bigger images are refused
/// before their pixels are allocated.
pub const MAX_DIMENSION: u32 = 4096;

const WHITE: u8 = 255;
const BLACK: u8 = 0;

/// A normalized 28x28 single-channel image, row-major, values in [0, 1].
/// Background is 0 and strokes are 1.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistImage {
    pixels: Vec<f32>,
}

impl MnistImage {
    pub const WIDTH: usize = CANVAS_SIZE as usize;
    pub const HEIGHT: usize = CANVAS_SIZE as usize;
    pub const LEN: usize = Self::WIDTH * Self::HEIGHT;

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    /// The pixel at column `x`, row `y`
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * Self::WIDTH + x]
    }

    /// Render back to an 8-bit image, strokes white on black. This is what the
    /// network sees.
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(CANVAS_SIZE, CANVAS_SIZE, |x, y| {
            let v = self.get(x as usize, y as usize);
            Luma([(v * 255.0).round() as u8])
        })
    }
}

/// Decode an encoded image (PNG, JPEG, ...) and normalize it. Images wider
/// or taller than `MAX_DIMENSION` fail with `ImageError::Limits`.
pub fn normalize_bytes(bytes: &[u8]) -> Result<MnistImage, ImageError> {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);

    let mut reader = Reader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    let image = reader.decode()?;
    Ok(normalize(&image))
}

/// Normalize an already decoded image
pub fn normalize(image: &DynamicImage) -> MnistImage {
    let binary = binarize(image);

    let digit = if binary.width() == 0 || binary.height() == 0 {
        GrayImage::from_pixel(DIGIT_SIZE, DIGIT_SIZE, Luma([WHITE]))
    } else {
        imageops::resize(&binary, DIGIT_SIZE, DIGIT_SIZE, FilterType::Nearest)
    };

    let mut canvas = GrayImage::from_pixel(CANVAS_SIZE, CANVAS_SIZE, Luma([WHITE]));
    imageops::replace(&mut canvas, &digit, MARGIN as i64, MARGIN as i64);
    imageops::invert(&mut canvas);

    let pixels = canvas.into_raw().into_iter().map(|p| p as f32 / 255.0).collect();
    MnistImage { pixels }
}

/// Grayscale and threshold. Transparent pixels are treated as white paper.
/// Reads pixel by pixel so only the 1 byte per pixel result is allocated.
fn binarize(image: &DynamicImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, a] = image.get_pixel(x, y).0;
        let luma = over_white(luma(r, g, b), a);
        Luma([if luma < THRESHOLD { BLACK } else { WHITE }])
    })
}

/// ITU-R 601-2 luma
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}

/// Composite a gray value with alpha `a` over white
fn over_white(v: u8, a: u8) -> u8 {
    let (v, a) = (v as u32, a as u32);
    ((v * a + WHITE as u32 * (255 - a)) / 255) as u8
}
