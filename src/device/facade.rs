use crossbeam::channel::Sender;
use std::sync::Arc;

use super::characteristics::CameraCharacteristics;
use super::image::{Image, ImageFormat};
use super::metadata::{CaptureRequest, CaptureResult, RequestTemplate};
use crate::error::DeviceError;

/// Identifier of a configured output surface
pub type SurfaceId = u32;

/// Lifecycle transitions reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Opened,
    /// No outputs are configured
    Unconfigured,
    /// Output configuration is being applied
    Busy,
    /// Outputs are configured and no capture is in flight
    Idle,
    Active,
    Closed,
    Error,
}

pub trait DeviceStateListener: Send + Sync {
    fn on_state_changed(&self, state: DeviceState);
}

/// Receiver of per-capture metadata. Invoked on a device-owned thread.
pub trait CaptureListener: Send + Sync {
    fn on_capture_completed(&self, request: &CaptureRequest, result: CaptureResult);

    fn on_capture_failed(&self, request: &CaptureRequest, reason: &str);
}

/// Write end of an image reader's bounded queue
#[derive(Debug, Clone)]
pub struct ImageSink {
    tx: Sender<Image>,
}

impl ImageSink {
    pub fn new(tx: Sender<Image>) -> Self {
        Self { tx }
    }

    /// Hand an image to the reader, blocking while its queue is full
    pub fn deliver(&self, image: Image) -> Result<(), DeviceError> {
        self.tx.send(image).map_err(|_| DeviceError::Disconnected)
    }
}

/// An output the device writes one image into per capture that targets it
#[derive(Debug, Clone)]
pub struct Surface {
    pub id: SurfaceId,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    sink: ImageSink,
}

impl Surface {
    pub fn new(id: SurfaceId, format: ImageFormat, width: u32, height: u32, sink: ImageSink) -> Self {
        Self {
            id,
            format,
            width,
            height,
            sink,
        }
    }

    pub fn deliver(&self, image: Image) -> Result<(), DeviceError> {
        self.sink.deliver(image)
    }
}

/// Contract of an imaging device driven by the control service.
///
/// Callbacks (state transitions, capture results, image delivery) happen on
/// threads owned by the implementation. Every capture delivers exactly one
/// image to each surface it targets.
pub trait CameraDevice: Send + Sync {
    fn id(&self) -> &str;

    fn characteristics(&self) -> &CameraCharacteristics;

    fn open(&self, listener: Arc<dyn DeviceStateListener>) -> Result<(), DeviceError>;

    /// Replace the active output set. Completion is signalled through the
    /// state listener as `Busy` followed by `Idle`.
    fn configure_outputs(&self, surfaces: Vec<Surface>) -> Result<(), DeviceError>;

    fn create_capture_request(&self, template: RequestTemplate) -> Result<CaptureRequest, DeviceError>;

    /// Submit a single capture, returning the frame number assigned to it
    fn capture(
        &self,
        request: CaptureRequest,
        listener: Arc<dyn CaptureListener>,
    ) -> Result<u64, DeviceError>;

    fn set_repeating_request(
        &self,
        _request: CaptureRequest,
        _listener: Arc<dyn CaptureListener>,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported {
            operation: "repeating request".to_string(),
        })
    }

    fn stop_repeating(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError>;
}
