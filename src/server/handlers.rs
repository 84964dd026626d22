use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ItsConfig, TimeoutConfig};
use crate::device::{
    keys, values, CameraDevice, DngEncoder, Haptics, RequestTemplate,
};
use crate::error::{DeviceError, Result, SessionError};
use crate::protocol::{
    CaptureParams, Command, Response, ResponseSender, ResponseTag, ThreeAParams, VibrateParams,
};
use crate::session::{
    resolve_output_specs, CaptureBatch, CaptureSessionManager, OutputFormat, SensorEventLog,
    StateWaiter, ThreeAController,
};

/// Executes decoded commands against the device.
///
/// Owns the device session for the lifetime of the process; connections
/// come and go around it.
pub struct CommandHandler {
    device: Arc<dyn CameraDevice>,
    session: CaptureSessionManager,
    sensors: Arc<SensorEventLog>,
    haptics: Option<Arc<dyn Haptics>>,
    encoder: Arc<dyn DngEncoder>,
    timeouts: TimeoutConfig,
    max_output_surfaces: usize,
    active_batch: Option<Arc<CaptureBatch>>,
}

impl CommandHandler {
    /// Open `device` and prepare to serve commands for it
    pub fn open(
        device: Arc<dyn CameraDevice>,
        config: &ItsConfig,
        encoder: Arc<dyn DngEncoder>,
        sensors: Arc<SensorEventLog>,
        haptics: Option<Arc<dyn Haptics>>,
    ) -> Result<Self> {
        let state = Arc::new(StateWaiter::new());
        device.open(state.clone())?;
        info!("Opened camera {}", device.id());

        let session = CaptureSessionManager::new(
            Arc::clone(&device),
            state,
            config.timeouts.clone(),
            config.camera.reader_buffers,
        );

        Ok(Self {
            device,
            session,
            sensors,
            haptics,
            encoder,
            timeouts: config.timeouts.clone(),
            max_output_surfaces: config.camera.max_output_surfaces,
            active_batch: None,
        })
    }

    pub async fn handle(
        &mut self,
        command: Command,
        responses: &ResponseSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match command {
            Command::GetCameraProperties => self.get_camera_properties(responses),
            Command::StartSensorEvents => self.start_sensor_events(responses),
            Command::GetSensorEvents => self.get_sensor_events(responses),
            Command::Do3A(params) => self.do_3a(&params, responses, cancel).await,
            Command::DoCapture(params) => self.do_capture(params, responses, cancel).await,
            Command::DoVibrate(params) => self.do_vibrate(&params, responses),
        }
    }

    /// Drop per-connection state: any in-flight batch and the readers
    pub fn end_session(&mut self) {
        if let Some(batch) = self.active_batch.take() {
            debug!("Aborting batch {} at session end", batch.id());
            batch.abort();
        }
        self.session.release_readers();
    }

    pub fn close(&mut self) -> Result<()> {
        self.end_session();
        self.device.close()?;
        info!("Closed camera {}", self.device.id());
        Ok(())
    }

    fn get_camera_properties(&self, responses: &ResponseSender) -> Result<()> {
        let body = json!({ "cameraProperties": self.device.characteristics().to_json() });
        responses.send(Response::object(ResponseTag::CameraProperties, body))
    }

    fn start_sensor_events(&self, responses: &ResponseSender) -> Result<()> {
        self.sensors.start();
        responses.send(Response::text(ResponseTag::SensorEventsStarted, ""))
    }

    fn get_sensor_events(&self, responses: &ResponseSender) -> Result<()> {
        let events = self.sensors.drain();
        responses.send(Response::object(
            ResponseTag::SensorEvents,
            SensorEventLog::to_json(&events),
        ))
    }

    async fn do_3a(
        &mut self,
        params: &ThreeAParams,
        responses: &ResponseSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let controller = ThreeAController::new(
            Arc::clone(&self.device),
            responses.clone(),
            self.timeouts.three_a(),
        );
        controller.run(&mut self.session, params, cancel).await
    }

    async fn do_capture(
        &mut self,
        params: CaptureParams,
        responses: &ResponseSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if params.requests.is_empty() {
            return Err(SessionError::NoCaptureRequests.into());
        }
        let specs = resolve_output_specs(
            params.output_surfaces.as_deref(),
            self.device.characteristics(),
            self.max_output_surfaces,
        )?;
        let wants_dng = specs.iter().any(|s| s.format == OutputFormat::Dng);

        let mut requests = Vec::with_capacity(params.requests.len());
        for overrides in &params.requests {
            let mut request = self
                .device
                .create_capture_request(RequestTemplate::StillCapture)?;
            request.merge(overrides);
            if wants_dng {
                request.set(
                    keys::STATISTICS_LENS_SHADING_MAP_MODE,
                    values::LENS_SHADING_MAP_MODE_ON,
                );
            }
            requests.push(request);
        }

        self.session.configure(&specs).await?;

        let batch = CaptureBatch::new(
            specs,
            requests.len(),
            Arc::clone(&self.device),
            Arc::clone(&self.encoder),
            responses.clone(),
            self.timeouts.capture(),
        );
        self.active_batch = Some(Arc::clone(&batch));
        self.session.set_listeners(batch.image_listeners())?;

        let targets = self.session.surface_ids();
        let count = requests.len();
        for (ordinal, mut request) in requests.into_iter().enumerate() {
            for id in &targets {
                request.add_target(*id);
            }
            if let Err(e) = self.device.capture(request, batch.result_listener(ordinal)) {
                batch.abort();
                self.active_batch = None;
                return Err(e.into());
            }
        }
        info!(
            "Submitted {} captures to {} surfaces (batch {})",
            count,
            targets.len(),
            batch.id()
        );

        let outcome = batch.wait_complete(cancel).await;
        if outcome.is_err() {
            batch.abort();
        }
        self.active_batch = None;
        outcome
    }

    fn do_vibrate(&self, params: &VibrateParams, responses: &ResponseSender) -> Result<()> {
        let haptics = self.haptics.as_ref().ok_or_else(|| {
            warn!("Vibration requested but no haptics backend is present");
            DeviceError::HapticsUnavailable
        })?;
        haptics.vibrate(&params.pattern)?;
        responses.send(Response::text(ResponseTag::VibrationStarted, ""))
    }
}
