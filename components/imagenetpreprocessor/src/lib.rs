//! Turns an arbitrary user image into the `[1, 3, 224, 224]` planar `f32`
//! tensor an ImageNet classifier expects.
//!
//! The source is resampled onto a fixed square regardless of its aspect ratio
//! and every sample is scaled into `[0, 1]`. No per-channel mean/std
//! normalization is applied.

use ml_types::{MlResult, Tensor};
use ndarray::ArrayView4;

mod processor;

pub const CHANNELS: u32 = 3;
pub const HEIGHT: u32 = 224;
pub const WIDTH: u32 = 224;

pub const SHAPE: [u32; 4] = [1, CHANNELS, HEIGHT, WIDTH];

/// Uploads above this size are rejected before decoding.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const PLANE_LEN: usize = (HEIGHT * WIDTH) as usize;

/// A preprocessed image, immutable once produced.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    source_width: u32,
    source_height: u32,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        SHAPE.map(|d| d as usize)
    }

    /// Flat planar samples: the R plane, then G, then B.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        // the constructor guarantees data.len() == 3 * 224 * 224
        ArrayView4::from_shape(self.shape(), &self.data)
            .unwrap_or_else(|_| unreachable!("image tensor length is fixed"))
    }

    /// One contiguous channel plane, `channel` in `0..3`.
    pub fn plane(&self, channel: usize) -> Option<&[f32]> {
        let start = channel.checked_mul(PLANE_LEN)?;
        self.data.get(start..start + PLANE_LEN)
    }

    /// Dimensions of the decoded image before resampling.
    pub fn source_dimensions(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }

    /// Encode as an `f32` [`Tensor`] for an inference engine.
    pub fn to_tensor(&self) -> MlResult<Tensor> {
        Tensor::from_f32(&SHAPE, &self.data)
    }
}

/// Preprocess an encoded image, enforcing [`MAX_IMAGE_BYTES`].
pub fn preprocess(bytes: &[u8]) -> PreprocessResult<ImageTensor> {
    preprocess_with_limit(bytes, MAX_IMAGE_BYTES)
}

/// Preprocess an encoded image with a caller supplied size limit.
pub fn preprocess_with_limit(bytes: &[u8], max_bytes: usize) -> PreprocessResult<ImageTensor> {
    if bytes.len() > max_bytes {
        log::warn!(
            "rejecting image of {} bytes, limit is {} bytes",
            bytes.len(),
            max_bytes
        );
        return Err(PreprocessError::ImageTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let image = processor::decode(bytes)?;
    let (source_width, source_height) = (image.width(), image.height());

    let canvas = processor::resize_to_canvas(&image, WIDTH, HEIGHT);
    let data = processor::rgba_to_planar(canvas.as_raw(), WIDTH as usize, HEIGHT as usize)?;

    log::debug!(
        "preprocessed {}x{} image ({} bytes) into {:?}",
        source_width,
        source_height,
        bytes.len(),
        SHAPE
    );

    Ok(ImageTensor {
        data,
        source_width,
        source_height,
    })
}

pub type PreprocessResult<T> = Result<T, PreprocessError>;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image is {size} bytes, the limit is {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },

    #[error("unable to decode image: {0}")]
    ImageDecodeError(String),

    #[error("unexpected pixel buffer layout: {0}")]
    LayoutError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(image: RgbaImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut buf), format)
            .unwrap();
        buf
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        encode(RgbaImage::from_pixel(width, height, Rgba(rgba)), ImageFormat::Png)
    }

    #[test]
    fn solid_color_maps_to_constant_planes() {
        let tensor = preprocess(&solid(64, 48, [200, 100, 25, 255])).unwrap();

        assert_eq!(tensor.shape(), [1, 3, 224, 224]);
        assert_eq!(tensor.data().len(), 3 * 224 * 224);
        for (channel, value) in [200u8, 100, 25].iter().enumerate() {
            let expected = *value as f32 / 255.0;
            let plane = tensor.plane(channel).unwrap();
            assert!(plane.iter().all(|v| (v - expected).abs() < 1e-6));
        }
    }

    #[test]
    fn aspect_ratio_is_not_preserved() {
        let tensor = preprocess(&solid(300, 20, [0, 0, 0, 255])).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 224, 224]);
        assert_eq!(tensor.source_dimensions(), (300, 20));
    }

    #[test]
    fn alpha_channel_is_discarded() {
        let tensor = preprocess(&solid(8, 8, [255, 0, 51, 128])).unwrap();
        assert!(tensor.plane(0).unwrap().iter().all(|v| (v - 1.0).abs() < 0.01));
        assert!(tensor.plane(1).unwrap().iter().all(|v| v.abs() < 0.01));
        assert!(tensor.plane(2).unwrap().iter().all(|v| (v - 0.2).abs() < 0.01));
        assert!(tensor.plane(3).is_none());
    }

    #[test]
    fn layout_is_planar() {
        // left half red, right half blue, already at target size
        let image = RgbaImage::from_fn(WIDTH, HEIGHT, |x, _| {
            if x < WIDTH / 2 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let tensor = preprocess(&encode(image, ImageFormat::Png)).unwrap();
        let view = tensor.view();

        assert_eq!(view[[0, 0, 10, 0]], 1.0);
        assert_eq!(view[[0, 2, 10, 0]], 0.0);
        assert_eq!(view[[0, 0, 10, 223]], 0.0);
        assert_eq!(view[[0, 2, 10, 223]], 1.0);
    }

    #[test]
    fn every_sample_is_in_unit_range() {
        let image = RgbaImage::from_fn(97, 131, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        let tensor = preprocess(&encode(image, ImageFormat::Bmp)).unwrap();
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn oversized_input_is_rejected_before_decoding() {
        let bytes = vec![0u8; MAX_IMAGE_BYTES + 1];
        assert!(matches!(
            preprocess(&bytes),
            Err(PreprocessError::ImageTooLarge { size, limit })
                if size == MAX_IMAGE_BYTES + 1 && limit == MAX_IMAGE_BYTES
        ));
    }

    #[test]
    fn corrupt_input_is_a_decode_error() {
        let mut bytes = solid(16, 16, [1, 2, 3, 255]);
        bytes.truncate(20);
        assert!(matches!(
            preprocess(&bytes),
            Err(PreprocessError::ImageDecodeError(_))
        ));
        assert!(matches!(
            preprocess(b"definitely not an image"),
            Err(PreprocessError::ImageDecodeError(_))
        ));
    }

    #[test]
    fn tensor_encoding_keeps_shape() {
        let tensor = preprocess(&solid(4, 4, [10, 20, 30, 255])).unwrap();
        let encoded = tensor.to_tensor().unwrap();
        assert_eq!(encoded.shape, SHAPE.to_vec());
        assert_eq!(encoded.data.len(), 3 * 224 * 224 * 4);
    }
}
