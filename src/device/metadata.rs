use serde::Serialize;
use serde_json::{json, Map, Value};

use super::facade::SurfaceId;

/// Metadata keys understood by the control service
pub mod keys {
    pub const CONTROL_MODE: &str = "android.control.mode";
    pub const CONTROL_CAPTURE_INTENT: &str = "android.control.captureIntent";
    pub const CONTROL_AE_MODE: &str = "android.control.aeMode";
    pub const CONTROL_AE_EXPOSURE_COMPENSATION: &str = "android.control.aeExposureCompensation";
    pub const CONTROL_AE_LOCK: &str = "android.control.aeLock";
    pub const CONTROL_AE_REGIONS: &str = "android.control.aeRegions";
    pub const CONTROL_AE_PRECAPTURE_TRIGGER: &str = "android.control.aePrecaptureTrigger";
    pub const CONTROL_AE_STATE: &str = "android.control.aeState";
    pub const CONTROL_AF_MODE: &str = "android.control.afMode";
    pub const CONTROL_AF_REGIONS: &str = "android.control.afRegions";
    pub const CONTROL_AF_TRIGGER: &str = "android.control.afTrigger";
    pub const CONTROL_AF_STATE: &str = "android.control.afState";
    pub const CONTROL_AWB_MODE: &str = "android.control.awbMode";
    pub const CONTROL_AWB_LOCK: &str = "android.control.awbLock";
    pub const CONTROL_AWB_REGIONS: &str = "android.control.awbRegions";
    pub const CONTROL_AWB_STATE: &str = "android.control.awbState";
    pub const FLASH_MODE: &str = "android.flash.mode";
    pub const SENSOR_SENSITIVITY: &str = "android.sensor.sensitivity";
    pub const SENSOR_EXPOSURE_TIME: &str = "android.sensor.exposureTime";
    pub const SENSOR_FRAME_DURATION: &str = "android.sensor.frameDuration";
    pub const SENSOR_TIMESTAMP: &str = "android.sensor.timestamp";
    pub const LENS_FOCUS_DISTANCE: &str = "android.lens.focusDistance";
    pub const COLOR_CORRECTION_GAINS: &str = "android.colorCorrection.gains";
    pub const COLOR_CORRECTION_TRANSFORM: &str = "android.colorCorrection.transform";
    pub const STATISTICS_LENS_SHADING_MAP_MODE: &str = "android.statistics.lensShadingMapMode";
}

/// Enumerated control values
pub mod values {
    pub const CONTROL_MODE_AUTO: i64 = 1;
    pub const CAPTURE_INTENT_PREVIEW: i64 = 1;
    pub const CAPTURE_INTENT_STILL_CAPTURE: i64 = 2;
    pub const AE_MODE_ON: i64 = 1;
    pub const AF_MODE_AUTO: i64 = 1;
    pub const AWB_MODE_AUTO: i64 = 1;
    pub const FLASH_MODE_OFF: i64 = 0;
    pub const AE_PRECAPTURE_TRIGGER_START: i64 = 1;
    pub const AF_TRIGGER_START: i64 = 1;
    pub const LENS_SHADING_MAP_MODE_ON: i64 = 1;
}

/// Auto-exposure routine state as reported in capture results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

impl AeState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AeState::Inactive),
            1 => Some(AeState::Searching),
            2 => Some(AeState::Converged),
            3 => Some(AeState::Locked),
            4 => Some(AeState::FlashRequired),
            5 => Some(AeState::Precapture),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AeState::Inactive => 0,
            AeState::Searching => 1,
            AeState::Converged => 2,
            AeState::Locked => 3,
            AeState::FlashRequired => 4,
            AeState::Precapture => 5,
        }
    }
}

/// Auto-focus routine state as reported in capture results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
    PassiveUnfocused,
}

impl AfState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AfState::Inactive),
            1 => Some(AfState::PassiveScan),
            2 => Some(AfState::PassiveFocused),
            3 => Some(AfState::ActiveScan),
            4 => Some(AfState::FocusedLocked),
            5 => Some(AfState::NotFocusedLocked),
            6 => Some(AfState::PassiveUnfocused),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AfState::Inactive => 0,
            AfState::PassiveScan => 1,
            AfState::PassiveFocused => 2,
            AfState::ActiveScan => 3,
            AfState::FocusedLocked => 4,
            AfState::NotFocusedLocked => 5,
            AfState::PassiveUnfocused => 6,
        }
    }
}

/// Auto-white-balance routine state as reported in capture results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwbState {
    Inactive,
    Searching,
    Converged,
    Locked,
}

impl AwbState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AwbState::Inactive),
            1 => Some(AwbState::Searching),
            2 => Some(AwbState::Converged),
            3 => Some(AwbState::Locked),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AwbState::Inactive => 0,
            AwbState::Searching => 1,
            AwbState::Converged => 2,
            AwbState::Locked => 3,
        }
    }
}

/// Request templates the device can pre-populate settings from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    Manual,
}

/// A metering region in active-array pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeteringRectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub weight: i32,
}

impl MeteringRectangle {
    pub fn to_value(&self) -> Value {
        json!({
            "x": self.x,
            "y": self.y,
            "width": self.width,
            "height": self.height,
            "weight": self.weight,
        })
    }
}

/// One unit of "expose a frame": template, settings and target surfaces
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    template: RequestTemplate,
    settings: Map<String, Value>,
    targets: Vec<SurfaceId>,
}

impl CaptureRequest {
    pub fn new(template: RequestTemplate) -> Self {
        Self {
            template,
            settings: Map::new(),
            targets: Vec::new(),
        }
    }

    pub fn template(&self) -> RequestTemplate {
        self.template
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.settings.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Overlay client-supplied settings on top of the template defaults
    pub fn merge(&mut self, overrides: &Map<String, Value>) {
        for (key, value) in overrides {
            self.settings.insert(key.clone(), value.clone());
        }
    }

    pub fn set_regions(&mut self, key: &str, regions: &[MeteringRectangle]) {
        let list: Vec<Value> = regions.iter().map(MeteringRectangle::to_value).collect();
        self.settings.insert(key.to_string(), Value::Array(list));
    }

    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    /// Settings rendered as the `captureRequest` object of a response
    pub fn to_json(&self) -> Value {
        Value::Object(self.settings.clone())
    }

    pub fn add_target(&mut self, surface: SurfaceId) {
        if !self.targets.contains(&surface) {
            self.targets.push(surface);
        }
    }

    pub fn targets(&self) -> &[SurfaceId] {
        &self.targets
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.settings.get(key).and_then(Value::as_i64)
    }

    pub fn has_ae_precapture_trigger(&self) -> bool {
        self.int(keys::CONTROL_AE_PRECAPTURE_TRIGGER) == Some(values::AE_PRECAPTURE_TRIGGER_START)
    }

    pub fn has_af_trigger(&self) -> bool {
        self.int(keys::CONTROL_AF_TRIGGER) == Some(values::AF_TRIGGER_START)
    }
}

/// Metadata the device reports back for one completed capture
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub frame_number: u64,
    metadata: Map<String, Value>,
}

impl CaptureResult {
    pub fn new(frame_number: u64, metadata: Map<String, Value>) -> Self {
        Self {
            frame_number,
            metadata,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.metadata.clone())
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(Value::as_i64)
    }

    pub fn ae_state(&self) -> Option<AeState> {
        self.int(keys::CONTROL_AE_STATE).and_then(AeState::from_code)
    }

    pub fn af_state(&self) -> Option<AfState> {
        self.int(keys::CONTROL_AF_STATE).and_then(AfState::from_code)
    }

    pub fn awb_state(&self) -> Option<AwbState> {
        self.int(keys::CONTROL_AWB_STATE).and_then(AwbState::from_code)
    }

    pub fn sensitivity(&self) -> Option<i64> {
        self.int(keys::SENSOR_SENSITIVITY)
    }

    pub fn exposure_time_ns(&self) -> Option<i64> {
        self.int(keys::SENSOR_EXPOSURE_TIME)
    }

    pub fn frame_duration_ns(&self) -> Option<i64> {
        self.int(keys::SENSOR_FRAME_DURATION)
    }

    pub fn focus_distance(&self) -> Option<f32> {
        self.metadata
            .get(keys::LENS_FOCUS_DISTANCE)
            .and_then(Value::as_f64)
            .map(|d| d as f32)
    }

    /// Per-channel white balance gains (R, G_even, G_odd, B)
    pub fn color_gains(&self) -> Option<[f32; 4]> {
        numeric_array(self.metadata.get(keys::COLOR_CORRECTION_GAINS)?)
    }

    /// Row-major 3x3 colour transform. Entries may be plain numbers or
    /// `{numerator, denominator}` rationals.
    pub fn color_transform(&self) -> Option<[f32; 9]> {
        numeric_array(self.metadata.get(keys::COLOR_CORRECTION_TRANSFORM)?)
    }

    /// One-line rendering of the fields of interest for debug logs
    pub fn summary(&self) -> String {
        let fmt_state = |code: Option<i64>| code.map_or("-".to_string(), |c| c.to_string());
        let fmt_ms = |ns: Option<i64>| ns.map_or("-".to_string(), |v| format!("{:.1}ms", v as f64 / 1e6));
        let gains = self
            .color_gains()
            .map_or("-".to_string(), |g| format!("{:?}", g));
        let transform = self
            .color_transform()
            .map_or("-".to_string(), |t| format!("{:?}", t));
        let focus = self
            .focus_distance()
            .map_or("-".to_string(), |f| format!("{:.2}", f));

        format!(
            "AE={} AF={} AWB={} sens={} exp={} dur={} gains={} xform={} foc={}",
            fmt_state(self.int(keys::CONTROL_AE_STATE)),
            fmt_state(self.int(keys::CONTROL_AF_STATE)),
            fmt_state(self.int(keys::CONTROL_AWB_STATE)),
            fmt_state(self.sensitivity()),
            fmt_ms(self.exposure_time_ns()),
            fmt_ms(self.frame_duration_ns()),
            gains,
            transform,
            focus
        )
    }
}

fn numeric_array<const N: usize>(value: &Value) -> Option<[f32; N]> {
    let items = value.as_array()?;
    if items.len() != N {
        return None;
    }
    let mut out = [0.0f32; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = numeric_value(item)?;
    }
    Some(out)
}

fn numeric_value(value: &Value) -> Option<f32> {
    if let Some(v) = value.as_f64() {
        return Some(v as f32);
    }
    let numerator = value.get("numerator")?.as_f64()?;
    let denominator = value.get("denominator")?.as_f64()?;
    if denominator == 0.0 {
        return None;
    }
    Some((numerator / denominator) as f32)
}
