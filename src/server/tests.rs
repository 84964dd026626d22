use super::*;
use crate::config::{ItsConfig, ServerConfig};
use crate::device::{
    synthetic_jpeg, Haptics, SensorEvent, SensorEventSink, SensorKind, SimulatedCamera,
    SimulatedHaptics, TiffDngEncoder,
};
use crate::error::{DeviceError, ItsError, ProtocolError, SessionError};
use crate::session::SensorEventLog;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn server_config() -> ServerConfig {
    ServerConfig {
        drain_timeout_ms: 1000,
        ..ItsConfig::default().server
    }
}

type Message = (Value, Option<Vec<u8>>);

struct Fixture {
    camera: Arc<SimulatedCamera>,
    sensors: Arc<SensorEventLog>,
    handler: CommandHandler,
}

fn fixture(haptics: Option<Arc<dyn Haptics>>) -> Fixture {
    let config = ItsConfig::default();
    let camera = Arc::new(SimulatedCamera::new("0", config.simulator.clone()).unwrap());
    let sensors = Arc::new(SensorEventLog::new());
    let handler = CommandHandler::open(
        camera.clone(),
        &config,
        Arc::new(TiffDngEncoder::new()),
        sensors.clone(),
        haptics,
    )
    .unwrap();
    Fixture {
        camera,
        sensors,
        handler,
    }
}

/// Test-side end of a session
struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    fn new(stream: DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await.unwrap() == 0 {
            return None;
        }
        let header: Value = serde_json::from_str(&line).unwrap();
        let payload = match header.get("bufValueSize").and_then(Value::as_u64) {
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                self.reader.read_exact(&mut buf).await.unwrap();
                Some(buf)
            }
            None => None,
        };
        Some((header, payload))
    }

    /// Close our side and collect everything the server still sends
    async fn finish(mut self) -> Vec<Message> {
        self.writer.shutdown().await.unwrap();
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            messages.push(message);
        }
        messages
    }
}

fn tag(message: &Message) -> &str {
    message.0["tag"].as_str().unwrap()
}

/// Run a scripted client against one session
async fn run_script(
    handler: &mut CommandHandler,
    lines: &[&str],
) -> (crate::error::Result<()>, Vec<Message>) {
    run_script_with(handler, &server_config(), lines).await
}

async fn run_script_with(
    handler: &mut CommandHandler,
    config: &ServerConfig,
    lines: &[&str],
) -> (crate::error::Result<()>, Vec<Message>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let shutdown = CancellationToken::new();
    let client_side = async move {
        let mut client = Client::new(client);
        for line in lines {
            client.send(line).await;
        }
        client.finish().await
    };
    tokio::join!(
        serve_connection(handler, server, &shutdown, config),
        client_side
    )
}

#[tokio::test]
async fn test_get_camera_properties() {
    let mut fx = fixture(None);
    let (outcome, messages) =
        run_script(&mut fx.handler, &[r#"{"cmdName":"getCameraProperties"}"#]).await;

    outcome.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(tag(&messages[0]), "cameraProperties");
    let props = &messages[0].0["objValue"]["cameraProperties"];
    assert_eq!(props["cameraId"], json!("0"));
    assert!(messages[0].1.is_none());
}

#[tokio::test]
async fn test_jpeg_capture_round_trip() {
    let mut fx = fixture(None);
    let line = json!({
        "cmdName": "doCapture",
        "captureRequest": {"android.sensor.sensitivity": 400},
        "outputSurfaces": [{"format": "jpeg", "width": 640, "height": 480}],
    })
    .to_string();
    let (outcome, messages) = run_script(&mut fx.handler, &[line.as_str()]).await;

    outcome.unwrap();
    assert_eq!(messages.len(), 2);

    let image = messages.iter().find(|m| tag(m) == "jpegImage").unwrap();
    let expected = synthetic_jpeg(640, 480, 0);
    assert_eq!(image.0["bufValueSize"], json!(expected.len()));
    assert_eq!(image.1.as_deref(), Some(expected.as_slice()));

    let results = messages.iter().find(|m| tag(m) == "captureResults").unwrap();
    let body = &results.0["objValue"];
    assert_eq!(
        body["outputs"],
        json!([{"width": 640, "height": 480, "format": "jpeg"}])
    );
    assert!(body["captureResult"].is_object());

    let submitted = fx.camera.submitted_requests();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].int("android.sensor.sensitivity"), Some(400));
}

#[tokio::test]
async fn test_capture_list_emits_one_image_per_surface_per_request() {
    let mut fx = fixture(None);
    let line = json!({
        "cmdName": "doCapture",
        "captureRequestList": [{}, {}],
        "outputSurfaces": [{"format": "yuv"}, {"format": "jpeg", "width": 320, "height": 240}],
    })
    .to_string();
    let (outcome, messages) = run_script(&mut fx.handler, &[line.as_str()]).await;

    outcome.unwrap();
    let count = |name: &str| messages.iter().filter(|m| tag(m) == name).count();
    assert_eq!(count("yuvImage"), 2);
    assert_eq!(count("jpegImage"), 2);
    assert_eq!(count("captureResults"), 2);
}

#[tokio::test]
async fn test_empty_capture_is_rejected_before_the_device() {
    let mut fx = fixture(None);
    let (outcome, messages) =
        run_script(&mut fx.handler, &[r#"{"cmdName":"doCapture"}"#]).await;

    assert!(matches!(
        outcome,
        Err(ItsError::Session(SessionError::NoCaptureRequests))
    ));
    assert!(messages.is_empty());
    assert!(fx.camera.submitted_requests().is_empty());
}

#[tokio::test]
async fn test_unknown_command_ends_session_silently() {
    let mut fx = fixture(None);
    let (outcome, messages) = run_script(
        &mut fx.handler,
        &[
            r#"{"cmdName":"selfDestruct"}"#,
            r#"{"cmdName":"getCameraProperties"}"#,
        ],
    )
    .await;

    assert!(matches!(
        outcome,
        Err(ItsError::Protocol(ProtocolError::UnknownCommand { .. }))
    ));
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let mut fx = fixture(None);
    let (outcome, messages) = run_script(
        &mut fx.handler,
        &[
            "this is not json",
            r#"{"noCmdName":true}"#,
            "",
            r#"{"cmdName":"getCameraProperties"}"#,
        ],
    )
    .await;

    outcome.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(tag(&messages[0]), "cameraProperties");
}

#[tokio::test]
async fn test_overlong_line_ends_session() {
    let mut fx = fixture(None);
    let config = ServerConfig {
        max_line_bytes: 64,
        ..server_config()
    };
    let padding = "x".repeat(200);
    let long_line = json!({"cmdName": "getCameraProperties", "padding": padding}).to_string();
    let (outcome, messages) = run_script_with(
        &mut fx.handler,
        &config,
        &[
            r#"{"cmdName":"getCameraProperties"}"#,
            long_line.as_str(),
            r#"{"cmdName":"getCameraProperties"}"#,
        ],
    )
    .await;

    assert!(matches!(
        outcome,
        Err(ItsError::Protocol(ProtocolError::LineTooLong { limit: 64 }))
    ));
    assert_eq!(messages.len(), 1);
    assert_eq!(tag(&messages[0]), "cameraProperties");
}

#[tokio::test]
async fn test_vibrate() {
    let haptics = Arc::new(SimulatedHaptics::new());
    let shared: Arc<dyn Haptics> = haptics.clone();
    let mut fx = fixture(Some(shared));
    let (outcome, messages) = run_script(
        &mut fx.handler,
        &[r#"{"cmdName":"doVibrate","pattern":[0,150,50,150]}"#],
    )
    .await;

    outcome.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(tag(&messages[0]), "vibrationStarted");
    assert_eq!(messages[0].0["strValue"], json!(""));
    assert_eq!(haptics.patterns(), vec![vec![0, 150, 50, 150]]);
}

#[tokio::test]
async fn test_vibrate_without_haptics_is_fatal() {
    let mut fx = fixture(None);
    let (outcome, messages) =
        run_script(&mut fx.handler, &[r#"{"cmdName":"doVibrate","pattern":[100]}"#]).await;

    assert!(matches!(
        outcome,
        Err(ItsError::Device(DeviceError::HapticsUnavailable))
    ));
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_sensor_events_between_start_and_get() {
    let mut fx = fixture(None);
    let sensors = fx.sensors.clone();

    // Recorded before start: must not be reported.
    sensors.on_sensor_event(SensorEvent {
        kind: SensorKind::Gyroscope,
        timestamp_ns: 1,
        values: [0.0, 0.0, 0.0],
    });

    let (client, server) = tokio::io::duplex(1 << 16);
    let shutdown = CancellationToken::new();
    let client_side = async move {
        let mut client = Client::new(client);
        client.send(r#"{"cmdName":"startSensorEvents"}"#).await;
        let started = client.recv().await.unwrap();
        assert_eq!(tag(&started), "sensorEventsStarted");

        sensors.on_sensor_event(SensorEvent {
            kind: SensorKind::Accelerometer,
            timestamp_ns: 42,
            values: [0.5, -9.75, 0.25],
        });
        client.send(r#"{"cmdName":"getSensorEvents"}"#).await;
        client.finish().await
    };
    let config = server_config();
    let (outcome, messages) = tokio::join!(
        serve_connection(&mut fx.handler, server, &shutdown, &config),
        client_side
    );

    outcome.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(tag(&messages[0]), "sensorEvents");
    assert_eq!(
        messages[0].0["objValue"],
        json!({
            "accel": [{"time": 42, "x": 0.5, "y": -9.75, "z": 0.25}],
            "mag": [],
            "gyro": [],
        })
    );
    assert!(!fx.sensors.is_recording());
}

#[tokio::test]
async fn test_do_3a_reports_each_routine_then_done() {
    let mut fx = fixture(None);
    let (outcome, messages) = run_script(&mut fx.handler, &[r#"{"cmdName":"do3A"}"#]).await;

    outcome.unwrap();
    let tags: Vec<&str> = messages.iter().map(tag).collect();
    assert_eq!(tags.last(), Some(&"3aDone"));
    for name in ["aeResult", "awbResult", "afResult"] {
        assert_eq!(tags.iter().filter(|t| **t == name).count(), 1, "{}", name);
    }
    let af = messages.iter().find(|m| tag(m) == "afResult").unwrap();
    assert_eq!(af.0["strValue"], json!("5.000000"));
}

#[tokio::test]
async fn test_commands_after_3a_reuse_the_device() {
    let mut fx = fixture(None);
    let capture = json!({
        "cmdName": "doCapture",
        "captureRequest": {},
        "outputSurfaces": [{"format": "jpeg"}],
    })
    .to_string();
    let (outcome, messages) =
        run_script(&mut fx.handler, &[r#"{"cmdName":"do3A"}"#, capture.as_str()]).await;

    outcome.unwrap();
    let done = messages.iter().position(|m| tag(m) == "3aDone").unwrap();
    let image = messages.iter().position(|m| tag(m) == "jpegImage").unwrap();
    assert!(done < image);
}

#[tokio::test]
async fn test_shutdown_ends_idle_session() {
    let mut fx = fixture(None);
    let (client, server) = tokio::io::duplex(1 << 16);
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    let config = server_config();
    let (outcome, _) = tokio::join!(
        serve_connection(&mut fx.handler, server, &shutdown, &config),
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        }
    );

    assert!(matches!(outcome, Err(ItsError::Shutdown)));
    drop(client);
}

#[tokio::test]
async fn test_session_can_follow_a_failed_one() {
    let mut fx = fixture(None);
    let (first, _) = run_script(&mut fx.handler, &[r#"{"cmdName":"bogus"}"#]).await;
    assert!(first.is_err());

    let (second, messages) =
        run_script(&mut fx.handler, &[r#"{"cmdName":"getCameraProperties"}"#]).await;
    second.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_server_accepts_one_client_over_tcp() {
    let fx = fixture(None);
    let mut server = ItsServer::new(ItsConfig::default().server, fx.handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let client_side = async move {
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"{\"cmdName\":\"getCameraProperties\"}\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    };
    let (served, received) = tokio::join!(server.serve_next(listener, &shutdown), client_side);

    assert!(served.unwrap());
    let text = String::from_utf8(received).unwrap();
    let header: Value = serde_json::from_str(text.trim_end()).unwrap();
    assert_eq!(header["tag"], json!("cameraProperties"));

    // The listener is gone once the session has been accepted.
    assert!(TcpStream::connect(address).await.is_err());
    server.close().unwrap();
}

#[tokio::test]
async fn test_server_stops_waiting_on_shutdown() {
    let fx = fixture(None);
    let mut server = ItsServer::new(ItsConfig::default().server, fx.handler);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    assert!(!server.serve_next(listener, &shutdown).await.unwrap());
}
