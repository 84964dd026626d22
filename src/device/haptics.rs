use crate::error::DeviceError;

/// Fire-and-forget vibrator
pub trait Haptics: Send + Sync {
    /// Start an alternating off/on pattern of millisecond durations
    fn vibrate(&self, pattern_ms: &[u64]) -> Result<(), DeviceError>;
}
