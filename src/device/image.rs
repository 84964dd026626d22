use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel formats an output surface can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// YUV 4:2:0 with arbitrary plane strides
    Yuv420,
    /// Compressed JPEG stream
    Jpeg,
    /// 16 bits per pixel Bayer data
    RawSensor,
    /// Packed 10 bits per pixel Bayer data
    Raw10,
}

impl ImageFormat {
    /// Name used for this format in `outputs` descriptors on the wire
    pub fn wire_name(&self) -> &'static str {
        match self {
            ImageFormat::Yuv420 => "yuv",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::RawSensor => "raw",
            ImageFormat::Raw10 => "raw10",
        }
    }

    /// Surface family; a device reads at most one surface per family at a time
    pub fn family(&self) -> &'static str {
        match self {
            ImageFormat::Yuv420 => "YUV",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::RawSensor | ImageFormat::Raw10 => "RAW",
        }
    }
}

/// One plane of an image buffer
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    /// Bytes between the starts of two consecutive rows
    pub row_stride: usize,
    /// Bytes between two consecutive samples in a row
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Bytes, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }
}

/// An image buffer delivered by the device to one output surface
#[derive(Debug, Clone)]
pub struct Image {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Sensor timestamp in nanoseconds
    pub timestamp_ns: i64,
    pub planes: Vec<Plane>,
}

impl Image {
    /// Total bytes held across all planes
    #[cfg(test)]
    pub(crate) fn buffer_len(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }

    /// Row stride of the first plane, in bytes
    pub fn row_stride(&self) -> usize {
        self.planes.first().map(|p| p.row_stride).unwrap_or(0)
    }

    /// Image contents with row padding and sample interleaving removed.
    ///
    /// YUV_420_888 is repacked as planar I420 and RAW16 as tight 2-byte
    /// samples. JPEG and RAW10 buffers are returned as delivered; RAW10
    /// consumers use [`Image::row_stride`] to walk the rows.
    ///
    /// Returns `None` when a plane is missing or shorter than its geometry
    /// requires.
    pub fn packed_data(&self) -> Option<Bytes> {
        let width = self.width as usize;
        let height = self.height as usize;

        match self.format {
            ImageFormat::Jpeg | ImageFormat::Raw10 => self.planes.first().map(|p| p.data.clone()),
            ImageFormat::RawSensor => {
                let plane = self.planes.first()?;
                if plane.row_stride == width * 2 && plane.data.len() == width * height * 2 {
                    return Some(plane.data.clone());
                }
                let mut out = Vec::with_capacity(width * height * 2);
                copy_plane(&mut out, plane, width, height, 2)?;
                Some(Bytes::from(out))
            }
            ImageFormat::Yuv420 => {
                if self.planes.len() < 3 {
                    return None;
                }
                let chroma_width = width.div_ceil(2);
                let chroma_height = height.div_ceil(2);
                let mut out =
                    Vec::with_capacity(width * height + 2 * chroma_width * chroma_height);
                copy_plane(&mut out, &self.planes[0], width, height, 1)?;
                copy_plane(&mut out, &self.planes[1], chroma_width, chroma_height, 1)?;
                copy_plane(&mut out, &self.planes[2], chroma_width, chroma_height, 1)?;
                Some(Bytes::from(out))
            }
        }
    }
}

fn copy_plane(
    out: &mut Vec<u8>,
    plane: &Plane,
    width: usize,
    height: usize,
    bytes_per_sample: usize,
) -> Option<()> {
    let pixel_stride = plane.pixel_stride.max(bytes_per_sample);
    for row in 0..height {
        let start = row * plane.row_stride;
        if pixel_stride == bytes_per_sample {
            let end = start + width * bytes_per_sample;
            out.extend_from_slice(plane.data.get(start..end)?);
        } else {
            for col in 0..width {
                let offset = start + col * pixel_stride;
                out.extend_from_slice(plane.data.get(offset..offset + bytes_per_sample)?);
            }
        }
    }
    Some(())
}
