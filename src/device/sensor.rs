/// Motion sensors whose events can be recorded alongside captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Accelerometer,
    MagneticField,
    Gyroscope,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorEvent {
    pub kind: SensorKind,
    /// Event time in nanoseconds on the sensor clock
    pub timestamp_ns: i64,
    pub values: [f32; 3],
}

/// Consumer of motion events. Called from the sensor source's own thread.
pub trait SensorEventSink: Send + Sync {
    fn on_sensor_event(&self, event: SensorEvent);
}
