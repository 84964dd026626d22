use std::io::{Cursor, Write};
use std::sync::Arc;

use dng::ifd::{Ifd, IfdValue, Offsets};
use dng::tags::ifd as tiff_tags;
use dng::{DngWriter, FileType};
use tracing::debug;

use super::characteristics::CameraCharacteristics;
use super::image::{Image, ImageFormat};
use super::metadata::CaptureResult;
use crate::error::DeviceError;

/// TIFF photometric interpretation for colour filter array data
const PHOTOMETRIC_CFA: u16 = 32803;

/// Turns a RAW16 image and its capture result into a raw container
pub trait DngEncoder: Send + Sync {
    fn encode(
        &self,
        characteristics: &CameraCharacteristics,
        result: &CaptureResult,
        image: &Image,
    ) -> Result<Vec<u8>, DeviceError>;
}

/// Single-IFD uncompressed CFA DNG writer
pub struct TiffDngEncoder {
    software: String,
}

impl TiffDngEncoder {
    pub fn new() -> Self {
        Self {
            software: format!("itscam v{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TiffDngEncoder {
    fn default() -> Self {
        Self::new()
    }
}

struct StripOffsets {
    data: Vec<u8>,
}

impl Offsets for StripOffsets {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn write(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writer.write_all(&self.data)
    }
}

impl DngEncoder for TiffDngEncoder {
    fn encode(
        &self,
        characteristics: &CameraCharacteristics,
        result: &CaptureResult,
        image: &Image,
    ) -> Result<Vec<u8>, DeviceError> {
        if image.format != ImageFormat::RawSensor {
            return Err(DeviceError::Encoder {
                details: format!("expected a RAW16 image, got {:?}", image.format),
            });
        }
        let raw_data = image
            .packed_data()
            .ok_or_else(|| DeviceError::Encoder {
                details: "raw image planes are shorter than the image geometry".to_string(),
            })?
            .to_vec();
        let raw_data_len = raw_data.len() as u32;

        let mut ifd = Ifd::default();
        ifd.insert(tiff_tags::ImageWidth, IfdValue::Long(image.width));
        ifd.insert(tiff_tags::ImageLength, IfdValue::Long(image.height));
        ifd.insert(tiff_tags::BitsPerSample, IfdValue::Short(16));
        ifd.insert(tiff_tags::Compression, IfdValue::Short(1));
        ifd.insert(
            tiff_tags::PhotometricInterpretation,
            IfdValue::Short(PHOTOMETRIC_CFA),
        );
        ifd.insert(tiff_tags::SamplesPerPixel, IfdValue::Short(1));
        ifd.insert(tiff_tags::RowsPerStrip, IfdValue::Long(image.height));
        ifd.insert(tiff_tags::PlanarConfiguration, IfdValue::Short(1));
        ifd.insert(tiff_tags::Software, IfdValue::Ascii(self.software.clone()));

        let (active_w, active_h) = characteristics.active_array();
        ifd.insert(tiff_tags::Make, IfdValue::Ascii("itscam".to_string()));
        ifd.insert(
            tiff_tags::Model,
            IfdValue::Ascii(format!("sensor {}x{}", active_w, active_h)),
        );

        if let Some(exposure_ns) = result.exposure_time_ns() {
            let numerator = (exposure_ns / 1_000).clamp(0, u32::MAX as i64) as u32;
            let denominator = 1_000_000u32;
            let divisor = gcd(numerator, denominator);
            ifd.insert(
                tiff_tags::ExposureTime,
                IfdValue::Rational(numerator / divisor, denominator / divisor),
            );
        }

        if let Some(iso) = result.sensitivity() {
            ifd.insert(
                tiff_tags::ISOSpeedRatings,
                IfdValue::Short(iso.clamp(0, 65535) as u16),
            );
        }

        let offsets: Arc<dyn Offsets + Send + Sync> = Arc::new(StripOffsets { data: raw_data });
        ifd.insert(tiff_tags::StripOffsets, IfdValue::Offsets(offsets));
        ifd.insert(tiff_tags::StripByteCounts, IfdValue::Long(raw_data_len));

        let mut buffer = Vec::new();
        let cursor = Cursor::new(&mut buffer);
        DngWriter::write_dng(cursor, true, FileType::Dng, vec![ifd]).map_err(|e| {
            DeviceError::Encoder {
                details: format!("{:?}", e),
            }
        })?;

        debug!(
            "Encoded {}x{} raw frame {} into {} byte DNG",
            image.width,
            image.height,
            result.frame_number,
            buffer.len()
        );
        Ok(buffer)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}
