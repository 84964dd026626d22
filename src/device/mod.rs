mod characteristics;
mod dng_encoder;
mod facade;
mod haptics;
mod image;
mod metadata;
mod sensor;
mod simulated;
#[cfg(test)]
mod tests;

pub use characteristics::{CameraCharacteristics, StreamConfig};
pub use dng_encoder::{DngEncoder, TiffDngEncoder};
pub use facade::{
    CameraDevice, CaptureListener, DeviceState, DeviceStateListener, ImageSink, Surface, SurfaceId,
};
pub use haptics::Haptics;
pub use image::{Image, ImageFormat, Plane};
pub use metadata::{
    keys, values, AeState, AfState, AwbState, CaptureRequest, CaptureResult, MeteringRectangle,
    RequestTemplate,
};
pub use sensor::{SensorEvent, SensorEventSink, SensorKind};
pub use simulated::{synthetic_jpeg, SimulatedCamera, SimulatedHaptics, SimulatedMotion};
