use super::*;
use crate::config::SimulatorConfig;
use bytes::Bytes;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

struct RecordingStateListener {
    tx: Sender<DeviceState>,
}

impl DeviceStateListener for RecordingStateListener {
    fn on_state_changed(&self, state: DeviceState) {
        let _ = self.tx.send(state);
    }
}

enum Outcome {
    Completed(CaptureResult),
    Failed(String),
}

struct RecordingCaptureListener {
    tx: Sender<Outcome>,
}

impl CaptureListener for RecordingCaptureListener {
    fn on_capture_completed(&self, _request: &CaptureRequest, result: CaptureResult) {
        let _ = self.tx.send(Outcome::Completed(result));
    }

    fn on_capture_failed(&self, _request: &CaptureRequest, reason: &str) {
        let _ = self.tx.send(Outcome::Failed(reason.to_string()));
    }
}

fn open_camera(config: SimulatorConfig) -> (SimulatedCamera, Receiver<DeviceState>) {
    let camera = SimulatedCamera::new("0", config).unwrap();
    let (tx, rx) = unbounded();
    camera
        .open(Arc::new(RecordingStateListener { tx }))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), DeviceState::Opened);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), DeviceState::Unconfigured);
    (camera, rx)
}

fn surface(id: SurfaceId, format: ImageFormat, size: (u32, u32)) -> (Surface, Receiver<Image>) {
    let (tx, rx) = bounded(8);
    (
        Surface::new(id, format, size.0, size.1, ImageSink::new(tx)),
        rx,
    )
}

fn capture_listener() -> (Arc<dyn CaptureListener>, Receiver<Outcome>) {
    let (tx, rx) = unbounded();
    (Arc::new(RecordingCaptureListener { tx }), rx)
}

fn expect_result(rx: &Receiver<Outcome>) -> CaptureResult {
    match rx.recv_timeout(WAIT).unwrap() {
        Outcome::Completed(result) => result,
        Outcome::Failed(reason) => panic!("capture failed: {}", reason),
    }
}

#[test]
fn test_packed_yuv_strips_padding_and_interleaving() {
    // 4x2 luma with 2 bytes of padding, semi-planar chroma with padding
    let luma = Bytes::from(vec![1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0]);
    let chroma = Bytes::from(vec![10, 20, 11, 21, 0, 0]);
    let image = Image {
        format: ImageFormat::Yuv420,
        width: 4,
        height: 2,
        timestamp_ns: 0,
        planes: vec![
            Plane::new(luma, 6, 1),
            Plane::new(chroma.clone(), 6, 2),
            Plane::new(chroma.slice(1..), 6, 2),
        ],
    };

    let packed = image.packed_data().unwrap();
    assert_eq!(&packed[..], &[1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 20, 21]);
}

#[test]
fn test_packed_raw16_drops_row_padding() {
    let data = Bytes::from(vec![1, 0, 2, 0, 9, 9, 3, 0, 4, 0, 9, 9]);
    let image = Image {
        format: ImageFormat::RawSensor,
        width: 2,
        height: 2,
        timestamp_ns: 0,
        planes: vec![Plane::new(data, 6, 2)],
    };

    let packed = image.packed_data().unwrap();
    assert_eq!(&packed[..], &[1, 0, 2, 0, 3, 0, 4, 0]);
}

#[test]
fn test_packed_data_rejects_truncated_planes() {
    let image = Image {
        format: ImageFormat::RawSensor,
        width: 4,
        height: 4,
        timestamp_ns: 0,
        planes: vec![Plane::new(Bytes::from(vec![0u8; 10]), 8, 2)],
    };
    assert!(image.packed_data().is_none());

    let yuv = Image {
        format: ImageFormat::Yuv420,
        width: 2,
        height: 2,
        timestamp_ns: 0,
        planes: vec![Plane::new(Bytes::from(vec![0u8; 4]), 2, 1)],
    };
    assert!(yuv.packed_data().is_none());
}

#[test]
fn test_jpeg_and_raw10_pass_through() {
    let jpeg = Image {
        format: ImageFormat::Jpeg,
        width: 8,
        height: 8,
        timestamp_ns: 0,
        planes: vec![Plane::new(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 0, 0)],
    };
    assert_eq!(jpeg.packed_data().unwrap().len(), 4);

    let raw10 = Image {
        format: ImageFormat::Raw10,
        width: 4,
        height: 2,
        timestamp_ns: 0,
        planes: vec![Plane::new(Bytes::from(vec![0u8; 32]), 16, 0)],
    };
    assert_eq!(raw10.packed_data().unwrap().len(), 32);
    assert_eq!(raw10.row_stride(), 16);
}

#[test]
fn test_characteristics_sort_sizes_largest_first() {
    let characteristics = CameraCharacteristics::new(
        json!({}),
        vec![
            StreamConfig::new(ImageFormat::Jpeg, 320, 240),
            StreamConfig::new(ImageFormat::Jpeg, 1920, 1080),
            StreamConfig::new(ImageFormat::Yuv420, 640, 480),
            StreamConfig::new(ImageFormat::Jpeg, 640, 480),
        ],
        0.0,
        (1920, 1080),
    );

    assert_eq!(
        characteristics.output_sizes(ImageFormat::Jpeg),
        vec![(1920, 1080), (640, 480), (320, 240)]
    );
    assert_eq!(
        characteristics.largest_size(ImageFormat::Yuv420),
        Some((640, 480))
    );
    assert_eq!(characteristics.largest_size(ImageFormat::Raw10), None);
    assert!(characteristics.is_fixed_focus());
}

#[test]
fn test_capture_result_accessors() {
    let mut metadata = Map::new();
    metadata.insert(keys::CONTROL_AE_STATE.into(), json!(4));
    metadata.insert(keys::CONTROL_AF_STATE.into(), json!(4));
    metadata.insert(keys::CONTROL_AWB_STATE.into(), json!(2));
    metadata.insert(keys::SENSOR_SENSITIVITY.into(), json!(400));
    metadata.insert(keys::SENSOR_EXPOSURE_TIME.into(), json!(20_000_000));
    metadata.insert(keys::LENS_FOCUS_DISTANCE.into(), json!(2.5));
    metadata.insert(keys::COLOR_CORRECTION_GAINS.into(), json!([2.0, 1.0, 1.0, 1.5]));
    metadata.insert(
        keys::COLOR_CORRECTION_TRANSFORM.into(),
        json!([
            {"numerator": 1, "denominator": 2}, 0, 0,
            0, 1.0, 0,
            0, 0, {"numerator": 3, "denominator": 4}
        ]),
    );
    let result = CaptureResult::new(7, metadata);

    assert_eq!(result.ae_state(), Some(AeState::FlashRequired));
    assert_eq!(result.af_state(), Some(AfState::FocusedLocked));
    assert_eq!(result.awb_state(), Some(AwbState::Converged));
    assert_eq!(result.sensitivity(), Some(400));
    assert_eq!(result.exposure_time_ns(), Some(20_000_000));
    assert_eq!(result.focus_distance(), Some(2.5));
    assert_eq!(result.color_gains(), Some([2.0, 1.0, 1.0, 1.5]));

    let transform = result.color_transform().unwrap();
    assert_eq!(transform[0], 0.5);
    assert_eq!(transform[4], 1.0);
    assert_eq!(transform[8], 0.75);

    assert!(result.summary().contains("sens=400"));
}

#[test]
fn test_capture_request_merge_and_targets() {
    let mut request = CaptureRequest::new(RequestTemplate::StillCapture);
    request.set(keys::SENSOR_SENSITIVITY, 100);

    let mut overrides = Map::new();
    overrides.insert(keys::SENSOR_SENSITIVITY.into(), json!(800));
    overrides.insert(keys::CONTROL_AE_PRECAPTURE_TRIGGER.into(), json!(1));
    request.merge(&overrides);

    assert_eq!(request.int(keys::SENSOR_SENSITIVITY), Some(800));
    assert!(request.has_ae_precapture_trigger());
    assert!(!request.has_af_trigger());

    request.add_target(3);
    request.add_target(3);
    assert_eq!(request.targets(), &[3]);
}

#[test]
fn test_simulated_configure_reports_busy_then_idle() {
    let (camera, states) = open_camera(SimulatorConfig::default());
    let (yuv, _images) = surface(1, ImageFormat::Yuv420, (640, 480));

    camera.configure_outputs(vec![yuv]).unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), DeviceState::Busy);
    assert_eq!(states.recv_timeout(WAIT).unwrap(), DeviceState::Idle);
}

#[test]
fn test_simulated_rejects_unsupported_size() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (jpeg, _images) = surface(1, ImageFormat::Jpeg, (4000, 3000));

    let err = camera.configure_outputs(vec![jpeg]).unwrap_err();
    assert!(matches!(err, crate::error::DeviceError::Configuration { .. }));
}

#[test]
fn test_simulated_capture_delivers_image_and_result() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (jpeg, images) = surface(1, ImageFormat::Jpeg, (640, 480));
    camera.configure_outputs(vec![jpeg]).unwrap();

    let mut request = camera
        .create_capture_request(RequestTemplate::StillCapture)
        .unwrap();
    request.add_target(1);
    let (listener, outcomes) = capture_listener();
    let frame = camera.capture(request, listener).unwrap();
    assert_eq!(frame, 0);

    let image = images.recv_timeout(WAIT).unwrap();
    assert_eq!(image.format, ImageFormat::Jpeg);
    assert_eq!(image.buffer_len(), synthetic_jpeg(640, 480, 0).len());

    let result = expect_result(&outcomes);
    assert_eq!(result.frame_number, 0);
    assert_eq!(result.sensitivity(), Some(100));
    assert_eq!(camera.submitted_requests().len(), 1);
}

#[test]
fn test_simulated_capture_requires_configured_target() {
    let (camera, _states) = open_camera(SimulatorConfig::default());

    let request = camera
        .create_capture_request(RequestTemplate::Preview)
        .unwrap();
    let (listener, _outcomes) = capture_listener();
    assert!(camera.capture(request.clone(), listener.clone()).is_err());

    let mut targeted = request;
    targeted.add_target(9);
    assert!(camera.capture(targeted, listener).is_err());
}

#[test]
fn test_simulated_ae_converges_after_trigger() {
    let config = SimulatorConfig {
        ae_converge_frames: 3,
        awb_converge_frames: 1,
        ..SimulatorConfig::default()
    };
    let (camera, _states) = open_camera(config);
    let (yuv, images) = surface(1, ImageFormat::Yuv420, (640, 480));
    camera.configure_outputs(vec![yuv]).unwrap();
    let (listener, outcomes) = capture_listener();

    let mut states = Vec::new();
    for i in 0..3 {
        let mut request = camera.create_capture_request(RequestTemplate::Preview).unwrap();
        if i == 0 {
            request.set(keys::CONTROL_AE_PRECAPTURE_TRIGGER, values::AE_PRECAPTURE_TRIGGER_START);
        }
        request.add_target(1);
        camera.capture(request, listener.clone()).unwrap();
        images.recv_timeout(WAIT).unwrap();
        let result = expect_result(&outcomes);
        states.push((result.ae_state(), result.awb_state()));
    }

    assert_eq!(
        states,
        vec![
            (Some(AeState::Searching), Some(AwbState::Converged)),
            (Some(AeState::Searching), Some(AwbState::Converged)),
            (Some(AeState::Converged), Some(AwbState::Converged)),
        ]
    );
}

#[test]
fn test_simulated_af_locks_after_trigger() {
    let config = SimulatorConfig {
        min_focus_distance: 10.0,
        af_converge_frames: 2,
        ..SimulatorConfig::default()
    };
    let (camera, _states) = open_camera(config);
    let (yuv, images) = surface(1, ImageFormat::Yuv420, (640, 480));
    camera.configure_outputs(vec![yuv]).unwrap();
    let (listener, outcomes) = capture_listener();

    let mut af_states = Vec::new();
    for i in 0..3 {
        let mut request = camera.create_capture_request(RequestTemplate::Preview).unwrap();
        if i == 1 {
            request.set(keys::CONTROL_AF_TRIGGER, values::AF_TRIGGER_START);
        }
        request.add_target(1);
        camera.capture(request, listener.clone()).unwrap();
        images.recv_timeout(WAIT).unwrap();
        af_states.push(expect_result(&outcomes).af_state());
    }

    assert_eq!(
        af_states,
        vec![
            Some(AfState::Inactive),
            Some(AfState::ActiveScan),
            Some(AfState::FocusedLocked)
        ]
    );
}

#[test]
fn test_simulated_uncompressed_images_pack_to_expected_sizes() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (yuv, yuv_images) = surface(1, ImageFormat::Yuv420, (320, 240));
    let (raw, raw_images) = surface(2, ImageFormat::RawSensor, (656, 496));
    camera.configure_outputs(vec![yuv, raw]).unwrap();

    let mut request = camera
        .create_capture_request(RequestTemplate::StillCapture)
        .unwrap();
    request.add_target(1);
    request.add_target(2);
    let (listener, outcomes) = capture_listener();
    camera.capture(request, listener).unwrap();

    let yuv_image = yuv_images.recv_timeout(WAIT).unwrap();
    assert!(yuv_image.row_stride() > 320);
    assert_eq!(
        yuv_image.packed_data().unwrap().len(),
        320 * 240 + 2 * 160 * 120
    );

    let raw_image = raw_images.recv_timeout(WAIT).unwrap();
    assert_eq!(raw_image.packed_data().unwrap().len(), 656 * 496 * 2);

    expect_result(&outcomes);
}

#[test]
fn test_simulated_injected_failure_reports_capture_failed() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (jpeg, images) = surface(1, ImageFormat::Jpeg, (640, 480));
    camera.configure_outputs(vec![jpeg]).unwrap();

    camera.fail_next_capture();
    let mut request = camera
        .create_capture_request(RequestTemplate::StillCapture)
        .unwrap();
    request.add_target(1);
    let (listener, outcomes) = capture_listener();
    camera.capture(request, listener).unwrap();

    match outcomes.recv_timeout(WAIT).unwrap() {
        Outcome::Failed(reason) => assert!(reason.contains("injected")),
        Outcome::Completed(_) => panic!("expected a failed capture"),
    }
    assert!(images.try_recv().is_err());
}

#[test]
fn test_simulated_repeating_request_until_stopped() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (yuv, images) = surface(1, ImageFormat::Yuv420, (320, 240));
    camera.configure_outputs(vec![yuv]).unwrap();

    let mut request = camera.create_capture_request(RequestTemplate::Preview).unwrap();
    request.add_target(1);
    let (listener, outcomes) = capture_listener();
    camera.set_repeating_request(request, listener).unwrap();

    for _ in 0..3 {
        images.recv_timeout(WAIT).unwrap();
        expect_result(&outcomes);
    }
    camera.stop_repeating().unwrap();

    std::thread::sleep(Duration::from_millis(100));
    while images.try_recv().is_ok() {}
    std::thread::sleep(Duration::from_millis(100));
    assert!(images.try_recv().is_err());
}

#[test]
fn test_simulated_close_reports_closed() {
    let (camera, states) = open_camera(SimulatorConfig::default());
    camera.close().unwrap();
    assert_eq!(states.recv_timeout(WAIT).unwrap(), DeviceState::Closed);

    let (listener, _outcomes) = capture_listener();
    let mut request = CaptureRequest::new(RequestTemplate::Preview);
    request.add_target(1);
    assert!(camera.capture(request, listener).is_err());
}

#[test]
fn test_dng_encoder_writes_tiff_container() {
    let (camera, _states) = open_camera(SimulatorConfig::default());
    let (raw, raw_images) = surface(1, ImageFormat::RawSensor, (656, 496));
    camera.configure_outputs(vec![raw]).unwrap();

    let mut request = camera
        .create_capture_request(RequestTemplate::StillCapture)
        .unwrap();
    request.add_target(1);
    let (listener, outcomes) = capture_listener();
    camera.capture(request, listener).unwrap();

    let image = raw_images.recv_timeout(WAIT).unwrap();
    let result = expect_result(&outcomes);

    let encoded = TiffDngEncoder::new()
        .encode(camera.characteristics(), &result, &image)
        .unwrap();
    assert!(encoded.starts_with(b"II") || encoded.starts_with(b"MM"));
    assert!(encoded.len() > 656 * 496 * 2);
}

#[test]
fn test_dng_encoder_rejects_non_raw_images() {
    let characteristics = CameraCharacteristics::new(json!({}), Vec::new(), 0.0, (4, 4));
    let result = CaptureResult::new(0, Map::new());
    let image = Image {
        format: ImageFormat::Jpeg,
        width: 4,
        height: 4,
        timestamp_ns: 0,
        planes: vec![Plane::new(Bytes::from_static(&[0xFF, 0xD8]), 0, 0)],
    };

    assert!(TiffDngEncoder::new()
        .encode(&characteristics, &result, &image)
        .is_err());
}

#[test]
fn test_simulated_haptics_records_patterns() {
    let haptics = SimulatedHaptics::new();
    haptics.vibrate(&[0, 200, 100, 200]).unwrap();
    assert_eq!(haptics.patterns(), vec![vec![0, 200, 100, 200]]);
}
