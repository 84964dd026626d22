use serde::Deserialize;
use serde_json::{Map, Value};

use crate::device::MeteringRectangle;
use crate::error::ProtocolError;

/// Fields per metering region: x, y, width, height, weight
const REGION_FIELDS: usize = 5;

/// A decoded inbound command line
#[derive(Debug, Clone)]
pub enum Command {
    GetCameraProperties,
    StartSensorEvents,
    GetSensorEvents,
    Do3A(ThreeAParams),
    DoCapture(CaptureParams),
    DoVibrate(VibrateParams),
}

impl Command {
    /// Decode one line of the control stream.
    ///
    /// Lines that are not JSON objects with a `cmdName` string yield
    /// `MalformedCommand`; an unrecognised name yields `UnknownCommand`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::MalformedCommand {
                details: e.to_string(),
            })?;
        let name = value
            .get("cmdName")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedCommand {
                details: "missing cmdName".to_string(),
            })?;

        match name {
            "getCameraProperties" => Ok(Command::GetCameraProperties),
            "startSensorEvents" => Ok(Command::StartSensorEvents),
            "getSensorEvents" => Ok(Command::GetSensorEvents),
            "do3A" => ThreeAParams::from_value(&value).map(Command::Do3A),
            "doCapture" => CaptureParams::from_value(&value).map(Command::DoCapture),
            "doVibrate" => VibrateParams::from_value(&value).map(Command::DoVibrate),
            other => Err(ProtocolError::UnknownCommand {
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetCameraProperties => "getCameraProperties",
            Command::StartSensorEvents => "startSensorEvents",
            Command::GetSensorEvents => "getSensorEvents",
            Command::Do3A(_) => "do3A",
            Command::DoCapture(_) => "doCapture",
            Command::DoVibrate(_) => "doVibrate",
        }
    }
}

fn invalid(command: &str, details: impl ToString) -> ProtocolError {
    ProtocolError::InvalidParams {
        command: command.to_string(),
        details: details.to_string(),
    }
}

/// A metering region with coordinates normalized to the active array
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub weight: f64,
}

impl NormalizedRegion {
    /// The whole sensor at full weight
    pub fn full() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            weight: 1.0,
        }
    }

    /// Scale to pixel coordinates of an active array, clamped to its bounds
    pub fn to_metering(&self, active_array: (u32, u32)) -> MeteringRectangle {
        let (aw, ah) = (active_array.0 as f64, active_array.1 as f64);
        let x = (self.x * aw).round().clamp(0.0, aw);
        let y = (self.y * ah).round().clamp(0.0, ah);
        let width = (self.width * aw).round().clamp(0.0, aw - x);
        let height = (self.height * ah).round().clamp(0.0, ah - y);
        MeteringRectangle {
            x: x as i32,
            y: y as i32,
            width: width as i32,
            height: height as i32,
            weight: self.weight.round() as i32,
        }
    }

    fn from_fields(fields: &[f64]) -> Self {
        Self {
            x: fields[0],
            y: fields[1],
            width: fields[2],
            height: fields[3],
            weight: fields[4],
        }
    }
}

/// Regions arrive either as `[[x,y,w,h,wt],...]` or as one flat list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegionList {
    Nested(Vec<Vec<f64>>),
    Flat(Vec<f64>),
}

impl RegionList {
    fn into_regions(self) -> Result<Vec<NormalizedRegion>, String> {
        let regions: Vec<NormalizedRegion> = match self {
            RegionList::Nested(entries) => entries
                .iter()
                .map(|entry| {
                    if entry.len() == REGION_FIELDS {
                        Ok(NormalizedRegion::from_fields(entry))
                    } else {
                        Err(format!(
                            "region has {} fields, expected {}",
                            entry.len(),
                            REGION_FIELDS
                        ))
                    }
                })
                .collect::<Result<_, _>>()?,
            RegionList::Flat(values) => {
                if values.len() % REGION_FIELDS != 0 {
                    return Err(format!(
                        "flat region list length {} is not a multiple of {}",
                        values.len(),
                        REGION_FIELDS
                    ));
                }
                values
                    .chunks(REGION_FIELDS)
                    .map(NormalizedRegion::from_fields)
                    .collect()
            }
        };
        if regions.is_empty() {
            return Err("region list is empty".to_string());
        }
        Ok(regions)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawRegions {
    ae: Option<RegionList>,
    awb: Option<RegionList>,
    af: Option<RegionList>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTriggers {
    ae: Option<bool>,
    af: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawThreeA {
    #[serde(default)]
    regions: Option<RawRegions>,
    #[serde(default)]
    triggers: Option<RawTriggers>,
}

/// Parameters of `do3A`
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeAParams {
    pub ae_regions: Vec<NormalizedRegion>,
    pub awb_regions: Vec<NormalizedRegion>,
    pub af_regions: Vec<NormalizedRegion>,
    pub trigger_ae: bool,
    pub trigger_af: bool,
}

impl Default for ThreeAParams {
    fn default() -> Self {
        Self {
            ae_regions: vec![NormalizedRegion::full()],
            awb_regions: vec![NormalizedRegion::full()],
            af_regions: vec![NormalizedRegion::full()],
            trigger_ae: true,
            trigger_af: true,
        }
    }
}

impl ThreeAParams {
    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let raw: RawThreeA =
            serde_json::from_value(value.clone()).map_err(|e| invalid("do3A", e))?;
        let mut params = ThreeAParams::default();

        if let Some(regions) = raw.regions {
            let resolve = |list: Option<RegionList>, default: Vec<NormalizedRegion>| match list {
                Some(list) => list.into_regions().map_err(|e| invalid("do3A", e)),
                None => Ok(default),
            };
            params.ae_regions = resolve(regions.ae, params.ae_regions)?;
            params.awb_regions = resolve(regions.awb, params.awb_regions)?;
            params.af_regions = resolve(regions.af, params.af_regions)?;
        }
        if let Some(triggers) = raw.triggers {
            params.trigger_ae = triggers.ae.unwrap_or(true);
            params.trigger_af = triggers.af.unwrap_or(true);
        }
        Ok(params)
    }
}

/// One requested output surface; absent or non-positive sizes mean
/// "largest available"
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OutputSurfaceSpec {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OutputSurfaces {
    Many(Vec<OutputSurfaceSpec>),
    One(OutputSurfaceSpec),
}

/// Parameters of `doCapture`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureParams {
    /// Per-request settings, merged over a still-capture template
    pub requests: Vec<Map<String, Value>>,
    /// `None` when the command named no outputs
    pub output_surfaces: Option<Vec<OutputSurfaceSpec>>,
}

impl CaptureParams {
    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let as_object = |v: &Value| {
            v.as_object()
                .cloned()
                .ok_or_else(|| invalid("doCapture", "capture request must be a JSON object"))
        };

        let requests = if let Some(single) = value.get("captureRequest") {
            vec![as_object(single)?]
        } else if let Some(list) = value.get("captureRequestList") {
            list.as_array()
                .ok_or_else(|| invalid("doCapture", "captureRequestList must be an array"))?
                .iter()
                .map(as_object)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        let output_surfaces = match value.get("outputSurfaces") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let surfaces: OutputSurfaces =
                    serde_json::from_value(v.clone()).map_err(|e| invalid("doCapture", e))?;
                Some(match surfaces {
                    OutputSurfaces::Many(list) => list,
                    OutputSurfaces::One(spec) => vec![spec],
                })
            }
        };

        Ok(Self {
            requests,
            output_surfaces,
        })
    }
}

/// Parameters of `doVibrate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VibrateParams {
    /// Alternating off/on durations in milliseconds
    pub pattern: Vec<u64>,
}

impl VibrateParams {
    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value.clone()).map_err(|e| invalid("doVibrate", e))
    }
}
