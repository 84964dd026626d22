use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::characteristics::{CameraCharacteristics, StreamConfig};
use super::facade::{CameraDevice, CaptureListener, DeviceState, DeviceStateListener, Surface};
use super::haptics::Haptics;
use super::image::{Image, ImageFormat, Plane};
use super::metadata::{
    keys, values, AeState, AfState, AwbState, CaptureRequest, CaptureResult, RequestTemplate,
};
use super::sensor::{SensorEvent, SensorEventSink, SensorKind};
use crate::config::SimulatorConfig;
use crate::error::{DeviceError, ItsError, Result};

const FRAME_DURATION_NS: i64 = 33_333_333;
const DEFAULT_SENSITIVITY: i64 = 100;
const DEFAULT_EXPOSURE_NS: i64 = 10_000_000;
/// Extra bytes appended to every row of synthesized uncompressed buffers
const ROW_PADDING: usize = 16;

/// Deterministic in-process camera.
///
/// Images are produced on a pipeline thread and results on a separate
/// result thread, so the two callback streams arrive unordered relative to
/// each other just like on real hardware. AE and AWB converge a fixed number
/// of frames after the last precapture trigger, AF a fixed number of frames
/// after the last AF trigger.
pub struct SimulatedCamera {
    id: String,
    characteristics: CameraCharacteristics,
    shared: Arc<SimShared>,
    jobs: Sender<CaptureJob>,
    repeating: Mutex<Option<Arc<AtomicBool>>>,
}

struct SimShared {
    config: SimulatorConfig,
    fixed_focus: bool,
    state: Mutex<SimState>,
    next_frame: AtomicU64,
    submitted: Mutex<Vec<CaptureRequest>>,
    fail_next: AtomicBool,
}

#[derive(Default)]
struct SimState {
    opened: bool,
    listener: Option<Arc<dyn DeviceStateListener>>,
    surfaces: Vec<Surface>,
    convergence: ConvergenceModel,
}

#[derive(Default)]
struct ConvergenceModel {
    frames_since_ae_trigger: u32,
    frames_since_af_trigger: Option<u32>,
}

struct CaptureJob {
    frame_number: u64,
    request: CaptureRequest,
    listener: Arc<dyn CaptureListener>,
}

struct PendingResult {
    deliver_at: Instant,
    request: CaptureRequest,
    listener: Arc<dyn CaptureListener>,
    outcome: std::result::Result<CaptureResult, String>,
}

impl SimulatedCamera {
    pub fn new(id: impl Into<String>, config: SimulatorConfig) -> Result<Self> {
        let id = id.into();
        let characteristics = build_characteristics(&id, &config);
        let shared = Arc::new(SimShared {
            fixed_focus: characteristics.is_fixed_focus(),
            config,
            state: Mutex::new(SimState::default()),
            next_frame: AtomicU64::new(0),
            submitted: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        });

        let (jobs_tx, jobs_rx) = unbounded::<CaptureJob>();
        let (results_tx, results_rx) = unbounded::<PendingResult>();

        let pipeline_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("sim-{}-pipeline", id))
            .spawn(move || run_pipeline(pipeline_shared, jobs_rx, results_tx))?;
        thread::Builder::new()
            .name(format!("sim-{}-results", id))
            .spawn(move || run_result_delivery(results_rx))?;

        info!(
            "Simulated camera {} ready (active array {}x{}, min focus {})",
            id,
            characteristics.active_array().0,
            characteristics.active_array().1,
            characteristics.min_focus_distance()
        );

        Ok(Self {
            id,
            characteristics,
            shared,
            jobs: jobs_tx,
            repeating: Mutex::new(None),
        })
    }

    /// Every request submitted so far, in submission order
    pub fn submitted_requests(&self) -> Vec<CaptureRequest> {
        self.shared.submitted.lock().clone()
    }

    /// Make the next capture report a failure instead of a result
    pub fn fail_next_capture(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    fn notify(&self, state: DeviceState) {
        let listener = self.shared.state.lock().listener.clone();
        if let Some(listener) = listener {
            listener.on_state_changed(state);
        }
    }
}

impl CameraDevice for SimulatedCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn characteristics(&self) -> &CameraCharacteristics {
        &self.characteristics
    }

    fn open(&self, listener: Arc<dyn DeviceStateListener>) -> std::result::Result<(), DeviceError> {
        {
            let mut state = self.shared.state.lock();
            if state.opened {
                return Err(DeviceError::Access {
                    details: format!("camera {} is already open", self.id),
                });
            }
            state.opened = true;
            state.listener = Some(listener);
        }
        info!("Simulated camera {} opened", self.id);
        self.notify(DeviceState::Opened);
        self.notify(DeviceState::Unconfigured);
        Ok(())
    }

    fn configure_outputs(&self, surfaces: Vec<Surface>) -> std::result::Result<(), DeviceError> {
        let listener = {
            let mut state = self.shared.state.lock();
            if !state.opened {
                return Err(DeviceError::Access {
                    details: format!("camera {} is not open", self.id),
                });
            }
            for surface in &surfaces {
                let supported = self
                    .characteristics
                    .output_sizes(surface.format)
                    .contains(&(surface.width, surface.height));
                if !supported {
                    return Err(DeviceError::Configuration {
                        details: format!(
                            "{}x{} is not a supported {} size",
                            surface.width,
                            surface.height,
                            surface.format.wire_name()
                        ),
                    });
                }
            }
            debug!("Configuring {} output surfaces", surfaces.len());
            let configured_any = !surfaces.is_empty();
            state.surfaces = surfaces;
            state.listener.clone().map(|l| (l, configured_any))
        };

        if let Some((listener, configured_any)) = listener {
            thread::Builder::new()
                .name("sim-configure".to_string())
                .spawn(move || {
                    listener.on_state_changed(DeviceState::Busy);
                    thread::sleep(Duration::from_millis(2));
                    listener.on_state_changed(if configured_any {
                        DeviceState::Idle
                    } else {
                        DeviceState::Unconfigured
                    });
                })
                .map_err(|e| DeviceError::Configuration {
                    details: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn create_capture_request(
        &self,
        template: RequestTemplate,
    ) -> std::result::Result<CaptureRequest, DeviceError> {
        let mut request = CaptureRequest::new(template);
        let af_mode = if self.shared.fixed_focus {
            0
        } else {
            values::AF_MODE_AUTO
        };
        match template {
            RequestTemplate::Preview | RequestTemplate::StillCapture => {
                request.set(keys::CONTROL_MODE, values::CONTROL_MODE_AUTO);
                request.set(keys::CONTROL_AE_MODE, values::AE_MODE_ON);
                request.set(keys::CONTROL_AF_MODE, af_mode);
                request.set(keys::CONTROL_AWB_MODE, values::AWB_MODE_AUTO);
                request.set(
                    keys::CONTROL_CAPTURE_INTENT,
                    if template == RequestTemplate::Preview {
                        values::CAPTURE_INTENT_PREVIEW
                    } else {
                        values::CAPTURE_INTENT_STILL_CAPTURE
                    },
                );
            }
            RequestTemplate::Manual => {
                request.set(keys::CONTROL_MODE, 0);
                request.set(keys::CONTROL_AE_MODE, 0);
                request.set(keys::CONTROL_AF_MODE, 0);
                request.set(keys::CONTROL_AWB_MODE, 0);
                request.set(keys::SENSOR_SENSITIVITY, DEFAULT_SENSITIVITY);
                request.set(keys::SENSOR_EXPOSURE_TIME, DEFAULT_EXPOSURE_NS);
            }
        }
        request.set(keys::FLASH_MODE, values::FLASH_MODE_OFF);
        Ok(request)
    }

    fn capture(
        &self,
        request: CaptureRequest,
        listener: Arc<dyn CaptureListener>,
    ) -> std::result::Result<u64, DeviceError> {
        submit_capture(&self.shared, &self.jobs, request, listener)
    }

    fn set_repeating_request(
        &self,
        request: CaptureRequest,
        listener: Arc<dyn CaptureListener>,
    ) -> std::result::Result<(), DeviceError> {
        self.stop_repeating()?;

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let jobs = self.jobs.clone();
        let flag = Arc::clone(&running);
        thread::Builder::new()
            .name(format!("sim-{}-repeating", self.id))
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    if let Err(e) = submit_capture(&shared, &jobs, request.clone(), listener.clone()) {
                        warn!("Repeating request stopped: {}", e);
                        break;
                    }
                    thread::sleep(Duration::from_nanos(FRAME_DURATION_NS as u64));
                }
            })
            .map_err(|e| DeviceError::Configuration {
                details: e.to_string(),
            })?;

        *self.repeating.lock() = Some(running);
        Ok(())
    }

    fn stop_repeating(&self) -> std::result::Result<(), DeviceError> {
        if let Some(flag) = self.repeating.lock().take() {
            flag.store(false, Ordering::Relaxed);
            debug!("Repeating request stopped on camera {}", self.id);
        }
        Ok(())
    }

    fn close(&self) -> std::result::Result<(), DeviceError> {
        self.stop_repeating()?;
        {
            let mut state = self.shared.state.lock();
            state.opened = false;
            state.surfaces.clear();
        }
        self.notify(DeviceState::Closed);
        info!("Simulated camera {} closed", self.id);
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        if let Some(flag) = self.repeating.lock().take() {
            flag.store(false, Ordering::Relaxed);
        }
    }
}

fn submit_capture(
    shared: &SimShared,
    jobs: &Sender<CaptureJob>,
    request: CaptureRequest,
    listener: Arc<dyn CaptureListener>,
) -> std::result::Result<u64, DeviceError> {
    {
        let state = shared.state.lock();
        if !state.opened {
            return Err(DeviceError::Access {
                details: "camera is not open".to_string(),
            });
        }
        if request.targets().is_empty() {
            return Err(DeviceError::Configuration {
                details: "capture request has no target surfaces".to_string(),
            });
        }
        if let Some(missing) = request
            .targets()
            .iter()
            .find(|id| !state.surfaces.iter().any(|s| s.id == **id))
        {
            return Err(DeviceError::Configuration {
                details: format!("surface {} is not part of the active configuration", missing),
            });
        }
    }

    let frame_number = shared.next_frame.fetch_add(1, Ordering::SeqCst);
    shared.submitted.lock().push(request.clone());
    trace!("Queued simulated capture {}", frame_number);

    jobs.send(CaptureJob {
        frame_number,
        request,
        listener,
    })
    .map_err(|_| DeviceError::Disconnected)?;
    Ok(frame_number)
}

fn run_pipeline(shared: Arc<SimShared>, jobs: Receiver<CaptureJob>, results: Sender<PendingResult>) {
    debug!("Simulated capture pipeline started");
    let result_delay = Duration::from_millis(shared.config.result_delay_ms);

    for job in jobs.iter() {
        let timestamp_ns = job.frame_number as i64 * FRAME_DURATION_NS;
        let (targets, outcome) = {
            let mut state = shared.state.lock();
            let targets: Vec<Surface> = state
                .surfaces
                .iter()
                .filter(|s| job.request.targets().contains(&s.id))
                .cloned()
                .collect();
            let outcome = if shared.fail_next.swap(false, Ordering::SeqCst) {
                Err("injected capture failure".to_string())
            } else if targets.len() != job.request.targets().len() {
                Err("output configuration changed while the capture was queued".to_string())
            } else {
                let metadata = state.convergence.advance(
                    &job.request,
                    &shared.config,
                    shared.fixed_focus,
                    timestamp_ns,
                );
                Ok(CaptureResult::new(job.frame_number, metadata))
            };
            (targets, outcome)
        };

        if outcome.is_ok() {
            for surface in &targets {
                let image = synthesize_image(surface, job.frame_number, timestamp_ns);
                if let Err(e) = surface.deliver(image) {
                    warn!(
                        "Dropping frame {} for surface {}: {}",
                        job.frame_number, surface.id, e
                    );
                }
            }
        }

        let pending = PendingResult {
            deliver_at: Instant::now() + result_delay,
            request: job.request,
            listener: job.listener,
            outcome,
        };
        if results.send(pending).is_err() {
            break;
        }
    }
    debug!("Simulated capture pipeline stopped");
}

fn run_result_delivery(results: Receiver<PendingResult>) {
    for pending in results.iter() {
        let now = Instant::now();
        if pending.deliver_at > now {
            thread::sleep(pending.deliver_at - now);
        }
        match pending.outcome {
            Ok(result) => pending
                .listener
                .on_capture_completed(&pending.request, result),
            Err(reason) => pending.listener.on_capture_failed(&pending.request, &reason),
        }
    }
}

impl ConvergenceModel {
    fn advance(
        &mut self,
        request: &CaptureRequest,
        config: &SimulatorConfig,
        fixed_focus: bool,
        timestamp_ns: i64,
    ) -> Map<String, Value> {
        if request.has_ae_precapture_trigger() {
            self.frames_since_ae_trigger = 0;
        }
        self.frames_since_ae_trigger = self.frames_since_ae_trigger.saturating_add(1);

        if request.has_af_trigger() && !fixed_focus {
            self.frames_since_af_trigger = Some(0);
        }
        if let Some(frames) = self.frames_since_af_trigger.as_mut() {
            *frames = frames.saturating_add(1);
        }

        let ae_state = if self.frames_since_ae_trigger >= config.ae_converge_frames {
            AeState::Converged
        } else {
            AeState::Searching
        };
        let awb_state = if self.frames_since_ae_trigger >= config.awb_converge_frames {
            AwbState::Converged
        } else {
            AwbState::Searching
        };
        let af_state = match self.frames_since_af_trigger {
            Some(frames) if frames >= config.af_converge_frames => AfState::FocusedLocked,
            Some(_) => AfState::ActiveScan,
            None => AfState::Inactive,
        };
        let focus_distance = if af_state == AfState::FocusedLocked {
            config.min_focus_distance / 2.0
        } else {
            0.0
        };

        let mut metadata = request.settings().clone();
        metadata.insert(keys::CONTROL_AE_STATE.into(), ae_state.code().into());
        metadata.insert(keys::CONTROL_AF_STATE.into(), af_state.code().into());
        metadata.insert(keys::CONTROL_AWB_STATE.into(), awb_state.code().into());
        metadata.insert(
            keys::SENSOR_SENSITIVITY.into(),
            request
                .int(keys::SENSOR_SENSITIVITY)
                .unwrap_or(DEFAULT_SENSITIVITY)
                .into(),
        );
        metadata.insert(
            keys::SENSOR_EXPOSURE_TIME.into(),
            request
                .int(keys::SENSOR_EXPOSURE_TIME)
                .unwrap_or(DEFAULT_EXPOSURE_NS)
                .into(),
        );
        metadata.insert(keys::SENSOR_FRAME_DURATION.into(), FRAME_DURATION_NS.into());
        metadata.insert(keys::SENSOR_TIMESTAMP.into(), timestamp_ns.into());
        metadata.insert(keys::LENS_FOCUS_DISTANCE.into(), json!(focus_distance));
        metadata.insert(
            keys::COLOR_CORRECTION_GAINS.into(),
            json!([2.0, 1.0, 1.0, 1.5]),
        );
        let identity: Vec<Value> = (0..9)
            .map(|i| {
                let numerator = if i % 4 == 0 { 1 } else { 0 };
                json!({"numerator": numerator, "denominator": 1})
            })
            .collect();
        metadata.insert(keys::COLOR_CORRECTION_TRANSFORM.into(), Value::Array(identity));
        metadata
    }
}

fn build_characteristics(id: &str, config: &SimulatorConfig) -> CameraCharacteristics {
    let mut configs = Vec::new();
    configs.extend(
        config
            .yuv_sizes
            .iter()
            .map(|&(w, h)| StreamConfig::new(ImageFormat::Yuv420, w, h)),
    );
    configs.extend(
        config
            .jpeg_sizes
            .iter()
            .map(|&(w, h)| StreamConfig::new(ImageFormat::Jpeg, w, h)),
    );
    for &(w, h) in &config.raw_sizes {
        configs.push(StreamConfig::new(ImageFormat::RawSensor, w, h));
        configs.push(StreamConfig::new(ImageFormat::Raw10, w, h));
    }

    let stream_configs: Vec<Value> = configs
        .iter()
        .map(|c| {
            json!({
                "format": c.format.wire_name(),
                "width": c.width,
                "height": c.height,
                "input": false,
            })
        })
        .collect();
    let (active_w, active_h) = config.active_array;
    let blob = json!({
        "cameraId": id,
        "android.lens.info.minimumFocusDistance": config.min_focus_distance,
        "android.sensor.info.activeArraySize": {
            "left": 0,
            "top": 0,
            "right": active_w,
            "bottom": active_h,
        },
        "android.scaler.streamConfigurationMap": {
            "availableStreamConfigurations": stream_configs,
        },
    });

    CameraCharacteristics::new(blob, configs, config.min_focus_distance, config.active_array)
}

/// JPEG bytes the simulated device writes for a frame of the given size
pub fn synthetic_jpeg(width: u32, height: u32, frame_number: u64) -> Vec<u8> {
    let mut data = vec![
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x01, 0x00,
        0x48, 0x00, 0x48, 0x00, 0x00,
    ];
    let pattern_size = 1000 + (width as usize * height as usize) / 64;
    let pattern_byte = (frame_number % 256) as u8;
    data.extend(std::iter::repeat(pattern_byte).take(pattern_size));
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

fn synthesize_image(surface: &Surface, frame_number: u64, timestamp_ns: i64) -> Image {
    let width = surface.width as usize;
    let height = surface.height as usize;
    let seed = (frame_number % 256) as usize;

    let planes = match surface.format {
        ImageFormat::Jpeg => {
            let data = synthetic_jpeg(surface.width, surface.height, frame_number);
            vec![Plane::new(Bytes::from(data), 0, 0)]
        }
        ImageFormat::Yuv420 => {
            let y_stride = width + ROW_PADDING;
            let mut luma = vec![0u8; y_stride * height];
            for (y, row) in luma.chunks_mut(y_stride).enumerate() {
                for (x, px) in row.iter_mut().take(width).enumerate() {
                    *px = ((x + y + seed) & 0xFF) as u8;
                }
            }

            let chroma_width = width.div_ceil(2);
            let chroma_height = height.div_ceil(2);
            let uv_stride = chroma_width * 2 + ROW_PADDING;
            let mut chroma = vec![0u8; uv_stride * chroma_height];
            for row in chroma.chunks_mut(uv_stride) {
                for (i, px) in row.iter_mut().take(chroma_width * 2).enumerate() {
                    *px = if i % 2 == 0 { 112 } else { 144 };
                }
            }
            let chroma = Bytes::from(chroma);

            vec![
                Plane::new(Bytes::from(luma), y_stride, 1),
                Plane::new(chroma.clone(), uv_stride, 2),
                Plane::new(chroma.slice(1..), uv_stride, 2),
            ]
        }
        ImageFormat::RawSensor => {
            let stride = width * 2 + ROW_PADDING;
            let mut raw = vec![0u8; stride * height];
            for (y, row) in raw.chunks_mut(stride).enumerate() {
                for x in 0..width {
                    let sample = 64 + (((x ^ y) + seed) & 0x3FF) as u16;
                    row[x * 2..x * 2 + 2].copy_from_slice(&sample.to_le_bytes());
                }
            }
            vec![Plane::new(Bytes::from(raw), stride, 2)]
        }
        ImageFormat::Raw10 => {
            let row_bytes = width.div_ceil(4) * 5;
            let stride = row_bytes.next_multiple_of(ROW_PADDING);
            let raw = vec![0x40u8; stride * height];
            vec![Plane::new(Bytes::from(raw), stride, 0)]
        }
    };

    Image {
        format: surface.format,
        width: surface.width,
        height: surface.height,
        timestamp_ns,
        planes,
    }
}

/// Vibrator that only records the patterns it was asked to play
#[derive(Default)]
pub struct SimulatedHaptics {
    patterns: Mutex<Vec<Vec<u64>>>,
}

impl SimulatedHaptics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> Vec<Vec<u64>> {
        self.patterns.lock().clone()
    }
}

impl Haptics for SimulatedHaptics {
    fn vibrate(&self, pattern_ms: &[u64]) -> std::result::Result<(), DeviceError> {
        info!("Vibrating with pattern {:?}", pattern_ms);
        self.patterns.lock().push(pattern_ms.to_vec());
        Ok(())
    }
}

/// Synthetic accelerometer, magnetometer and gyroscope feed
pub struct SimulatedMotion {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimulatedMotion {
    pub fn spawn(sink: Arc<dyn SensorEventSink>, rate_hz: u32) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let period = Duration::from_secs(1) / rate_hz.max(1);

        let handle = thread::Builder::new()
            .name("sim-motion".to_string())
            .spawn(move || {
                let start = Instant::now();
                debug!("Simulated motion source started at {:?} per sample", period);
                while flag.load(Ordering::Relaxed) {
                    let elapsed = start.elapsed();
                    let t = elapsed.as_secs_f32();
                    let timestamp_ns = elapsed.as_nanos() as i64;
                    let wobble = (t * 3.0).sin() * 0.05;

                    sink.on_sensor_event(SensorEvent {
                        kind: SensorKind::Accelerometer,
                        timestamp_ns,
                        values: [wobble, -wobble, 9.81],
                    });
                    sink.on_sensor_event(SensorEvent {
                        kind: SensorKind::MagneticField,
                        timestamp_ns,
                        values: [22.0, -4.0 + wobble, -40.0],
                    });
                    sink.on_sensor_event(SensorEvent {
                        kind: SensorKind::Gyroscope,
                        timestamp_ns,
                        values: [wobble * 0.1, 0.0, -wobble * 0.1],
                    });
                    thread::sleep(period);
                }
                debug!("Simulated motion source stopped");
            })
            .map_err(ItsError::Io)?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Simulated motion thread panicked");
            }
        }
    }
}

impl Drop for SimulatedMotion {
    fn drop(&mut self) {
        self.stop();
    }
}
