use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::device::{SensorEvent, SensorEventSink, SensorKind};

#[derive(Default)]
struct LogState {
    recording: bool,
    events: Vec<SensorEvent>,
}

/// Buffers motion events between `startSensorEvents` and `getSensorEvents`
#[derive(Default)]
pub struct SensorEventLog {
    state: Mutex<LogState>,
}

impl SensorEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.recording = true;
        debug!("Sensor event recording started");
    }

    #[cfg(test)]
    pub(crate) fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    /// Take every buffered event and stop recording
    pub fn drain(&self) -> Vec<SensorEvent> {
        let mut state = self.state.lock();
        state.recording = false;
        let events = std::mem::take(&mut state.events);
        debug!("Drained {} sensor events", events.len());
        events
    }

    /// `sensorEvents` body: events grouped per sensor
    pub fn to_json(events: &[SensorEvent]) -> Value {
        let group = |kind: SensorKind| -> Vec<Value> {
            events
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| {
                    json!({
                        "time": e.timestamp_ns,
                        "x": e.values[0],
                        "y": e.values[1],
                        "z": e.values[2],
                    })
                })
                .collect()
        };
        json!({
            "accel": group(SensorKind::Accelerometer),
            "mag": group(SensorKind::MagneticField),
            "gyro": group(SensorKind::Gyroscope),
        })
    }
}

impl SensorEventSink for SensorEventLog {
    fn on_sensor_event(&self, event: SensorEvent) {
        let mut state = self.state.lock();
        if state.recording {
            trace!("Recorded {:?} event at {}", event.kind, event.timestamp_ns);
            state.events.push(event);
        }
    }
}
