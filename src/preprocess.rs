use image::{imageops::FilterType, ImageError};

/// Side length the classifier was trained on.
pub const INPUT_SIZE: u32 = 224;
const CHANNELS: usize = 3;

/// A single RGB image as an NHWC `f32` batch of size one, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    data: Vec<f32>,
}

impl Batch {
    pub const SHAPE: [u64; 4] = [1, INPUT_SIZE as u64, INPUT_SIZE as u64, CHANNELS as u64];

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> [u64; 4] {
        Self::SHAPE
    }
}

/// Decodes any supported image format, converts it to RGB, resizes it to
/// `INPUT_SIZE` square and scales every channel by `1/255`.
pub fn preprocess(image_data: &[u8]) -> Result<Batch, ImageError> {
    let rgb = image::load_from_memory(image_data)?.to_rgb8();
    let resized = image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let data: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|channel| channel as f32 / 255.0)
        .collect();

    Ok(Batch { data })
}
