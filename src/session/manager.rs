use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::reader::{ImageListener, ImageReader};
use super::state::StateWaiter;
use crate::config::TimeoutConfig;
use crate::device::{CameraCharacteristics, CameraDevice, DeviceState, ImageFormat, SurfaceId};
use crate::error::{ItsError, Result, SessionError};
use crate::protocol::OutputSurfaceSpec;

/// Output formats a client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Yuv,
    Jpeg,
    Raw,
    Raw10,
    /// RAW16 images re-encoded into a DNG container with their result
    Dng,
}

impl OutputFormat {
    /// Parse a wire format name; empty means YUV
    pub fn parse(name: &str) -> std::result::Result<Self, SessionError> {
        match name {
            "" | "yuv" => Ok(OutputFormat::Yuv),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "raw" => Ok(OutputFormat::Raw),
            "raw10" => Ok(OutputFormat::Raw10),
            "dng" => Ok(OutputFormat::Dng),
            other => Err(SessionError::UnsupportedFormat {
                format: other.to_string(),
            }),
        }
    }

    /// Format the device delivers for this output
    pub fn image_format(&self) -> ImageFormat {
        match self {
            OutputFormat::Yuv => ImageFormat::Yuv420,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Raw | OutputFormat::Dng => ImageFormat::RawSensor,
            OutputFormat::Raw10 => ImageFormat::Raw10,
        }
    }
}

/// A resolved output surface request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

impl OutputSpec {
    /// Descriptor reported in `captureResults.outputs`
    pub fn to_json(&self) -> Value {
        json!({
            "width": self.width,
            "height": self.height,
            "format": self.format.image_format().wire_name(),
        })
    }
}

/// Turn the requested surfaces into concrete specs. No outputs means one
/// full-size YUV surface. Every rejection happens here, before the device
/// is touched.
pub fn resolve_output_specs(
    requested: Option<&[OutputSurfaceSpec]>,
    characteristics: &CameraCharacteristics,
    max_surfaces: usize,
) -> std::result::Result<Vec<OutputSpec>, SessionError> {
    let default_spec = [OutputSurfaceSpec::default()];
    let requested = match requested {
        Some(list) if !list.is_empty() => list,
        _ => &default_spec[..],
    };
    if requested.len() > max_surfaces {
        return Err(SessionError::TooManySurfaces {
            requested: requested.len(),
            max: max_surfaces,
        });
    }

    let mut families = HashSet::new();
    let mut specs = Vec::with_capacity(requested.len());
    for surface in requested {
        let format = OutputFormat::parse(surface.format.as_deref().unwrap_or(""))?;
        let image_format = format.image_format();

        let (largest_w, largest_h) = characteristics.largest_size(image_format).ok_or_else(|| {
            SessionError::NoStreamConfigs {
                format: image_format.wire_name().to_string(),
            }
        })?;

        if !families.insert(image_format.family()) {
            return Err(SessionError::DuplicateSurfaceFamily {
                family: image_format.family().to_string(),
            });
        }

        let width = resolve_dimension("width", surface.width, largest_w)?;
        let height = resolve_dimension("height", surface.height, largest_h)?;
        specs.push(OutputSpec {
            format,
            width,
            height,
        });
    }
    Ok(specs)
}

/// A missing or non-positive dimension falls back to `largest` on its own
fn resolve_dimension(
    dimension: &str,
    requested: Option<i64>,
    largest: u32,
) -> std::result::Result<u32, SessionError> {
    match requested {
        Some(value) if value > 0 => {
            u32::try_from(value).map_err(|_| SessionError::InvalidSurfaceSize {
                dimension: dimension.to_string(),
                value,
            })
        }
        _ => Ok(largest),
    }
}

/// Owns the image readers of the current capture sequence
pub struct CaptureSessionManager {
    device: Arc<dyn CameraDevice>,
    state: Arc<StateWaiter>,
    timeouts: TimeoutConfig,
    reader_buffers: usize,
    readers: Vec<ImageReader>,
    next_surface_id: SurfaceId,
}

impl CaptureSessionManager {
    pub fn new(
        device: Arc<dyn CameraDevice>,
        state: Arc<StateWaiter>,
        timeouts: TimeoutConfig,
        reader_buffers: usize,
    ) -> Self {
        Self {
            device,
            state,
            timeouts,
            reader_buffers,
            readers: Vec::new(),
            next_surface_id: 1,
        }
    }

    /// Replace the readers with one per spec and bind the device outputs to
    /// them, waiting for the device to go busy and then idle.
    pub async fn configure(&mut self, specs: &[OutputSpec]) -> Result<()> {
        self.release_readers();

        for spec in specs {
            let id = self.next_surface_id;
            self.next_surface_id = self.next_surface_id.wrapping_add(1);
            self.readers.push(ImageReader::new(
                id,
                spec.format.image_format(),
                spec.width,
                spec.height,
                self.reader_buffers,
            ));
        }
        let surfaces = self.readers.iter().map(ImageReader::surface).collect();

        self.state.clear();
        self.device.configure_outputs(surfaces)?;
        self.state
            .wait_for_state(DeviceState::Busy, self.timeouts.state())
            .await?;
        self.state
            .wait_for_state(DeviceState::Idle, self.timeouts.idle())
            .await?;

        info!(
            "Configured {} output surfaces: {:?}",
            self.readers.len(),
            self.readers
                .iter()
                .map(|r| {
                    let (width, height) = r.size();
                    format!("{} {}x{}", r.format().wire_name(), width, height)
                })
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Attach one listener per reader, in reader order
    pub fn set_listeners(&mut self, listeners: Vec<Arc<dyn ImageListener>>) -> Result<()> {
        if listeners.len() != self.readers.len() {
            return Err(ItsError::system(format!(
                "{} listeners supplied for {} readers",
                listeners.len(),
                self.readers.len()
            )));
        }
        for (reader, listener) in self.readers.iter_mut().zip(listeners) {
            reader.set_listener(listener)?;
        }
        Ok(())
    }

    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        self.readers.iter().map(ImageReader::id).collect()
    }

    #[cfg(test)]
    pub(crate) fn readers(&self) -> &[ImageReader] {
        &self.readers
    }

    pub fn release_readers(&mut self) {
        if !self.readers.is_empty() {
            debug!("Releasing {} image readers", self.readers.len());
        }
        self.readers.clear();
    }
}
