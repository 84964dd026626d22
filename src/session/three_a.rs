use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::{CaptureSessionManager, OutputFormat, OutputSpec};
use super::reader::DroppingListener;
use crate::device::{
    keys, values, AeState, AfState, AwbState, CameraDevice, CaptureListener, CaptureRequest,
    CaptureResult, ImageFormat, MeteringRectangle, RequestTemplate, SurfaceId,
};
use crate::error::{ItsError, Result, SessionError};
use crate::protocol::{Response, ResponseSender, ResponseTag, ThreeAParams};

/// Reported focus distance for lenses that cannot focus
const FIXED_FOCUS_RESULT: &str = "0.0";

/// Signal side of a single-slot rendezvous
#[derive(Clone)]
pub struct GateOpener {
    tx: mpsc::Sender<()>,
}

impl GateOpener {
    /// Open the gate. Opening an already open gate is a no-op.
    pub fn open(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Wait side of a single-slot rendezvous; each successful wait closes the
/// gate again
pub struct Gate {
    rx: mpsc::Receiver<()>,
}

impl Gate {
    /// Returns false when the deadline passed with the gate still closed
    pub async fn wait(&mut self, deadline: Instant) -> bool {
        matches!(tokio::time::timeout_at(deadline, self.rx.recv()).await, Ok(Some(())))
    }
}

pub fn rendezvous_gate() -> (GateOpener, Gate) {
    let (tx, rx) = mpsc::channel(1);
    (GateOpener { tx }, Gate { rx })
}

/// Progress of one 3A run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreeAPhase {
    /// No result seen yet
    Idle,
    /// Exposure and white balance metering
    AwaitAeTrigger,
    /// Exposure settled, focus sweep outstanding
    AwaitAfTrigger,
    Converged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Convergence {
    results: u64,
    ae: bool,
    af: bool,
    awb: bool,
}

impl ThreeAPhase {
    fn from_progress(do_ae: bool, do_af: bool, progress: &Convergence) -> Self {
        if progress.results == 0 {
            ThreeAPhase::Idle
        } else if (do_ae && !progress.ae) || !progress.awb {
            ThreeAPhase::AwaitAeTrigger
        } else if do_af && !progress.af {
            ThreeAPhase::AwaitAfTrigger
        } else {
            ThreeAPhase::Converged
        }
    }
}

/// Which triggers to attach to the next 3A request. The AF trigger is held
/// back until AE has converged after its own trigger.
pub fn plan_triggers(
    do_ae: bool,
    do_af: bool,
    triggered_ae: bool,
    triggered_af: bool,
    converged_ae: bool,
) -> (bool, bool) {
    let ae_trigger = do_ae && !triggered_ae;
    let af_trigger = do_af && !triggered_af && (!do_ae || (triggered_ae && converged_ae));
    (ae_trigger, af_trigger)
}

struct MeteringRegions {
    ae: Vec<MeteringRectangle>,
    awb: Vec<MeteringRectangle>,
    af: Vec<MeteringRectangle>,
}

/// Build one 3A request against the preview template
fn build_three_a_request(
    device: &dyn CameraDevice,
    regions: &MeteringRegions,
    ae_trigger: bool,
    af_trigger: bool,
    target: SurfaceId,
) -> Result<CaptureRequest> {
    let mut request = device.create_capture_request(RequestTemplate::Preview)?;
    request.set(keys::FLASH_MODE, values::FLASH_MODE_OFF);
    request.set(keys::CONTROL_MODE, values::CONTROL_MODE_AUTO);
    request.set(keys::CONTROL_CAPTURE_INTENT, values::CAPTURE_INTENT_PREVIEW);
    request.set(keys::CONTROL_AE_MODE, values::AE_MODE_ON);
    request.set(keys::CONTROL_AE_EXPOSURE_COMPENSATION, 0);
    request.set(keys::CONTROL_AE_LOCK, false);
    request.set(keys::CONTROL_AWB_MODE, values::AWB_MODE_AUTO);
    request.set(keys::CONTROL_AWB_LOCK, false);
    request.set(keys::CONTROL_AF_MODE, values::AF_MODE_AUTO);
    request.set_regions(keys::CONTROL_AE_REGIONS, &regions.ae);
    request.set_regions(keys::CONTROL_AWB_REGIONS, &regions.awb);
    request.set_regions(keys::CONTROL_AF_REGIONS, &regions.af);

    if ae_trigger {
        request.set(
            keys::CONTROL_AE_PRECAPTURE_TRIGGER,
            values::AE_PRECAPTURE_TRIGGER_START,
        );
    }
    if af_trigger {
        request.set(keys::CONTROL_AF_TRIGGER, values::AF_TRIGGER_START);
    }
    request.add_target(target);
    Ok(request)
}

/// Receives 3A results, reports newly converged routines and opens the gate
struct ThreeAListener {
    progress: Arc<Mutex<Convergence>>,
    gate: GateOpener,
    responses: ResponseSender,
    report_af: bool,
}

impl ThreeAListener {
    fn emit(&self, response: Response) {
        if let Err(e) = self.responses.send(response) {
            warn!("Unable to queue 3A result: {}", e);
        }
    }
}

impl CaptureListener for ThreeAListener {
    fn on_capture_completed(&self, _request: &CaptureRequest, result: CaptureResult) {
        debug!("3A result {}: {}", result.frame_number, result.summary());

        let ae_converged = matches!(
            result.ae_state(),
            Some(AeState::Converged) | Some(AeState::FlashRequired)
        );
        let af_converged = matches!(result.af_state(), Some(AfState::FocusedLocked));
        let awb_converged = matches!(result.awb_state(), Some(AwbState::Converged));

        {
            let mut progress = self.progress.lock();
            progress.results += 1;

            if ae_converged && !progress.ae {
                match (result.sensitivity(), result.exposure_time_ns()) {
                    (Some(sensitivity), Some(exposure)) => self.emit(Response::text(
                        ResponseTag::AeResult,
                        format!("{} {}", sensitivity, exposure),
                    )),
                    _ => warn!("AE converged without sensitivity or exposure in the result"),
                }
            }
            if af_converged && self.report_af && !progress.af {
                match result.focus_distance() {
                    Some(distance) => self.emit(Response::text(
                        ResponseTag::AfResult,
                        format!("{:.6}", distance),
                    )),
                    None => warn!("AF locked without a focus distance in the result"),
                }
            }
            if awb_converged && !progress.awb {
                match (result.color_gains(), result.color_transform()) {
                    (Some(gains), Some(transform)) => self.emit(Response::text(
                        ResponseTag::AwbResult,
                        gains
                            .iter()
                            .chain(transform.iter())
                            .map(|v| format!("{:.6}", v))
                            .collect::<Vec<_>>()
                            .join(" "),
                    )),
                    _ => warn!("AWB converged without colour gains or transform in the result"),
                }
            }

            progress.ae = ae_converged;
            progress.af = af_converged;
            progress.awb = awb_converged;
        }

        self.gate.open();
    }

    fn on_capture_failed(&self, request: &CaptureRequest, reason: &str) {
        warn!(
            "3A capture failed ({}); ae trigger {}, af trigger {}",
            reason,
            request.has_ae_precapture_trigger(),
            request.has_af_trigger()
        );
        self.gate.open();
    }
}

/// Drives one `do3A` command
pub struct ThreeAController {
    device: Arc<dyn CameraDevice>,
    responses: ResponseSender,
    timeout: Duration,
}

impl ThreeAController {
    pub fn new(device: Arc<dyn CameraDevice>, responses: ResponseSender, timeout: Duration) -> Self {
        Self {
            device,
            responses,
            timeout,
        }
    }

    /// Run 3A to convergence. `3aDone` is queued on every exit path.
    pub async fn run(
        &self,
        session: &mut CaptureSessionManager,
        params: &ThreeAParams,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcome = self.converge(session, params, cancel).await;
        if let Err(e) = &outcome {
            warn!("3A did not converge: {}", e);
        }
        let done = self.responses.send(Response::text(ResponseTag::ThreeADone, ""));
        outcome?;
        done
    }

    async fn converge(
        &self,
        session: &mut CaptureSessionManager,
        params: &ThreeAParams,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let characteristics = self.device.characteristics();
        let (width, height) = characteristics
            .largest_size(ImageFormat::Yuv420)
            .ok_or_else(|| SessionError::NoStreamConfigs {
                format: ImageFormat::Yuv420.wire_name().to_string(),
            })?;
        session
            .configure(&[OutputSpec {
                format: OutputFormat::Yuv,
                width,
                height,
            }])
            .await?;
        session.set_listeners(vec![Arc::new(DroppingListener)])?;
        let target = session
            .surface_ids()
            .first()
            .copied()
            .ok_or_else(|| ItsError::system("3A output surface missing after configuration"))?;

        let active_array = characteristics.active_array();
        let scale = |regions: &[crate::protocol::NormalizedRegion]| {
            regions
                .iter()
                .map(|r| r.to_metering(active_array))
                .collect::<Vec<_>>()
        };
        let regions = MeteringRegions {
            ae: scale(&params.ae_regions),
            awb: scale(&params.awb_regions),
            af: scale(&params.af_regions),
        };

        let do_ae = params.trigger_ae;
        let mut do_af = params.trigger_af;
        if characteristics.is_fixed_focus() {
            debug!("Fixed-focus lens, skipping AF");
            do_af = false;
            self.responses
                .send(Response::text(ResponseTag::AfResult, FIXED_FOCUS_RESULT))?;
        }
        info!("Starting 3A (ae: {}, af: {}, awb: true)", do_ae, do_af);

        let progress = Arc::new(Mutex::new(Convergence::default()));
        let (opener, mut gate) = rendezvous_gate();
        let listener: Arc<dyn CaptureListener> = Arc::new(ThreeAListener {
            progress: Arc::clone(&progress),
            gate: opener.clone(),
            responses: self.responses.clone(),
            report_af: do_af,
        });

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut phase = ThreeAPhase::Idle;
        let mut triggered_ae = false;
        let mut triggered_af = false;
        let mut issued = 0u32;
        opener.open();

        loop {
            tokio::select! {
                opened = gate.wait(deadline) => {
                    if !opened {
                        return Err(ItsError::timeout(
                            format!("3A convergence after {} requests", issued),
                            self.timeout,
                        ));
                    }
                }
                _ = cancel.cancelled() => return Err(ItsError::Shutdown),
            }

            let snapshot = *progress.lock();
            let next_phase = ThreeAPhase::from_progress(do_ae, do_af, &snapshot);
            if next_phase != phase {
                debug!("3A phase {:?} -> {:?}", phase, next_phase);
                phase = next_phase;
            }
            if phase == ThreeAPhase::Converged {
                info!(
                    "3A converged after {} requests in {:?}",
                    issued,
                    started.elapsed()
                );
                return Ok(());
            }

            let (ae_trigger, af_trigger) =
                plan_triggers(do_ae, do_af, triggered_ae, triggered_af, snapshot.ae);
            let request = build_three_a_request(
                self.device.as_ref(),
                &regions,
                ae_trigger,
                af_trigger,
                target,
            )?;
            triggered_ae |= ae_trigger;
            triggered_af |= af_trigger;

            self.device.capture(request, Arc::clone(&listener))?;
            issued += 1;
        }
    }
}
