use crate::{PreprocessError, PreprocessResult, CHANNELS};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use ndarray::{Array4, ArrayView3};

const RGBA: usize = 4;

pub(crate) fn decode(bytes: &[u8]) -> PreprocessResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|error| {
        log::warn!("image decoding failed: {}", error);
        PreprocessError::ImageDecodeError(error.to_string())
    })
}

/// Hard resize onto a `width` x `height` canvas with bilinear filtering.
pub(crate) fn resize_to_canvas(image: &DynamicImage, width: u32, height: u32) -> RgbaImage {
    imageops::resize(&image.to_rgba8(), width, height, FilterType::Triangle)
}

/// Split interleaved RGBA samples into R, G and B planes scaled to `[0, 1]`.
pub(crate) fn rgba_to_planar(
    rgba: &[u8],
    width: usize,
    height: usize,
) -> PreprocessResult<Vec<f32>> {
    let interleaved = ArrayView3::from_shape((height, width, RGBA), rgba)
        .map_err(|error| PreprocessError::LayoutError(error.to_string()))?;

    let planar = Array4::from_shape_fn(
        (1, CHANNELS as usize, height, width),
        |(_, c, y, x)| interleaved[[y, x, c]] as f32 / 255.0,
    );

    Ok(planar.into_raw_vec())
}
