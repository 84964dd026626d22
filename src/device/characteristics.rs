use serde_json::Value;

use super::image::ImageFormat;

/// One output size a device supports for a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl StreamConfig {
    pub fn new(format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Static description of a device.
///
/// The JSON blob is passed through untouched as `cameraProperties`; the
/// typed fields are the ones the service itself needs.
#[derive(Debug, Clone)]
pub struct CameraCharacteristics {
    blob: Value,
    stream_configs: Vec<StreamConfig>,
    min_focus_distance: f32,
    active_array: (u32, u32),
}

impl CameraCharacteristics {
    pub fn new(
        blob: Value,
        mut stream_configs: Vec<StreamConfig>,
        min_focus_distance: f32,
        active_array: (u32, u32),
    ) -> Self {
        stream_configs.sort_by(|a, b| b.area().cmp(&a.area()));
        Self {
            blob,
            stream_configs,
            min_focus_distance,
            active_array,
        }
    }

    pub fn to_json(&self) -> Value {
        self.blob.clone()
    }

    /// Sizes offered for `format`, largest first
    pub fn output_sizes(&self, format: ImageFormat) -> Vec<(u32, u32)> {
        self.stream_configs
            .iter()
            .filter(|c| c.format == format)
            .map(|c| (c.width, c.height))
            .collect()
    }

    pub fn largest_size(&self, format: ImageFormat) -> Option<(u32, u32)> {
        self.output_sizes(format).into_iter().next()
    }

    pub fn min_focus_distance(&self) -> f32 {
        self.min_focus_distance
    }

    /// A minimum focus distance of zero means the lens cannot move
    pub fn is_fixed_focus(&self) -> bool {
        self.min_focus_distance <= 0.0
    }

    pub fn active_array(&self) -> (u32, u32) {
        self.active_array
    }
}
