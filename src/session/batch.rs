use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use super::manager::{OutputFormat, OutputSpec};
use super::reader::ImageListener;
use crate::device::{CameraDevice, CaptureListener, CaptureRequest, CaptureResult, DngEncoder, Image, ImageFormat};
use crate::error::{DeviceError, ItsError, Result, SessionError};
use crate::protocol::{Response, ResponseSender, ResponseTag};

struct ResultSlots {
    results: Vec<Option<Arc<CaptureResult>>>,
    aborted: bool,
}

/// Correlates the images and results of one `doCapture` command.
///
/// Every callback registered for the batch holds the batch itself, so late
/// callbacks from an earlier batch can never touch the counters of a later
/// one. Completion is reached after `requests * (outputs + 1)` deliveries;
/// this relies on the device writing exactly one image per targeted surface
/// per capture.
pub struct CaptureBatch {
    id: Uuid,
    outputs: Vec<OutputSpec>,
    requests: usize,
    device: Arc<dyn CameraDevice>,
    encoder: Arc<dyn DngEncoder>,
    responses: ResponseSender,
    timeout: Duration,
    deadline: Instant,
    image_counts: Vec<AtomicUsize>,
    slots: Mutex<ResultSlots>,
    slot_ready: Condvar,
    remaining: watch::Sender<usize>,
    fault: Mutex<Option<ItsError>>,
    faulted: CancellationToken,
}

impl CaptureBatch {
    pub fn new(
        outputs: Vec<OutputSpec>,
        requests: usize,
        device: Arc<dyn CameraDevice>,
        encoder: Arc<dyn DngEncoder>,
        responses: ResponseSender,
        timeout: Duration,
    ) -> Arc<Self> {
        let total = requests * (outputs.len() + 1);
        let (remaining, _) = watch::channel(total);
        let id = Uuid::new_v4();
        debug!(
            "Batch {} expects {} results and {} images",
            id,
            requests,
            requests * outputs.len()
        );

        Arc::new(Self {
            id,
            image_counts: outputs.iter().map(|_| AtomicUsize::new(0)).collect(),
            outputs,
            requests,
            device,
            encoder,
            responses,
            timeout,
            deadline: Instant::now() + timeout,
            slots: Mutex::new(ResultSlots {
                results: vec![None; requests],
                aborted: false,
            }),
            slot_ready: Condvar::new(),
            remaining,
            fault: Mutex::new(None),
            faulted: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// One listener per output, in output order
    pub fn image_listeners(self: &Arc<Self>) -> Vec<Arc<dyn ImageListener>> {
        (0..self.outputs.len())
            .map(|output_index| {
                Arc::new(BatchImageListener {
                    batch: Arc::clone(self),
                    output_index,
                }) as Arc<dyn ImageListener>
            })
            .collect()
    }

    /// Listener bound to the request submitted at `ordinal`
    pub fn result_listener(self: &Arc<Self>, ordinal: usize) -> Arc<dyn CaptureListener> {
        Arc::new(BatchResultListener {
            batch: Arc::clone(self),
            ordinal,
        })
    }

    /// Callbacks still outstanding
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until every image and result was forwarded, the deadline passes,
    /// a callback faults or the connection is torn down.
    pub async fn wait_complete(&self, cancel: &CancellationToken) -> Result<()> {
        let mut remaining = self.remaining.subscribe();
        let deadline = tokio::time::Instant::from_std(self.deadline);

        tokio::select! {
            outcome = tokio::time::timeout_at(deadline, remaining.wait_for(|n| *n == 0)) => {
                match outcome {
                    Ok(Ok(_)) => {
                        info!("Batch {} complete ({} captures)", self.id, self.requests);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(ItsError::system("batch completion channel closed")),
                    Err(_) => Err(ItsError::timeout(
                        format!("capture batch with {} callbacks outstanding", self.remaining()),
                        self.timeout,
                    )),
                }
            }
            _ = self.faulted.cancelled() => Err(self.take_fault()),
            _ = cancel.cancelled() => Err(ItsError::Shutdown),
        }
    }

    /// Release any callback blocked on a result slot
    pub fn abort(&self) {
        let mut slots = self.slots.lock();
        if !slots.aborted {
            slots.aborted = true;
            trace!("Batch {} aborted", self.id);
        }
        drop(slots);
        self.slot_ready.notify_all();
    }

    fn is_aborted(&self) -> bool {
        self.slots.lock().aborted
    }

    fn fail(&self, err: ItsError) {
        error!("Batch {} failed: {}", self.id, err);
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(err);
            }
        }
        self.abort();
        self.faulted.cancel();
    }

    fn take_fault(&self) -> ItsError {
        self.fault
            .lock()
            .take()
            .unwrap_or_else(|| ItsError::system("capture batch faulted"))
    }

    fn count_down(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn on_image(&self, output_index: usize, image: Image) {
        if self.is_aborted() {
            trace!("Batch {} ignoring late {:?} image", self.id, image.format);
            return;
        }
        if let Err(e) = self.forward_image(output_index, image) {
            self.fail(e);
        }
    }

    fn forward_image(&self, output_index: usize, image: Image) -> Result<()> {
        let output = self
            .outputs
            .get(output_index)
            .ok_or_else(|| ItsError::system(format!("no output at index {}", output_index)))?;
        let ordinal = self.image_counts[output_index].fetch_add(1, Ordering::SeqCst);
        if ordinal >= self.requests {
            return Err(ItsError::system(format!(
                "output {} delivered more images than the {} requests of the batch",
                output_index, self.requests
            )));
        }

        let response = match image.format {
            ImageFormat::RawSensor if output.format == OutputFormat::Dng => {
                let result = self.wait_for_result(ordinal)?;
                let encoded =
                    self.encoder
                        .encode(self.device.characteristics(), &result, &image)?;
                Response::buffer(ResponseTag::DngImage, encoded)
            }
            ImageFormat::Jpeg => Response::buffer(ResponseTag::JpegImage, packed(&image)?),
            ImageFormat::Yuv420 => Response::buffer(ResponseTag::YuvImage, packed(&image)?),
            ImageFormat::Raw10 => Response::buffer(ResponseTag::Raw10Image, packed(&image)?)
                .with_object(json!({"byteStride": image.row_stride()})),
            ImageFormat::RawSensor => Response::buffer(ResponseTag::RawImage, packed(&image)?),
        };

        debug!(
            "Batch {} forwarding {} for capture {} ({} bytes)",
            self.id,
            response.tag.as_str(),
            ordinal,
            response.payload.as_ref().map_or(0, Bytes::len)
        );
        self.responses.send(response)?;
        self.count_down();
        Ok(())
    }

    /// Block the calling reader thread until the result for `ordinal`
    /// arrives, the batch deadline passes or the batch is aborted
    fn wait_for_result(&self, ordinal: usize) -> Result<Arc<CaptureResult>> {
        let mut slots = self.slots.lock();
        loop {
            if slots.aborted {
                return Err(ItsError::Shutdown);
            }
            if let Some(result) = slots.results.get(ordinal).cloned().flatten() {
                return Ok(result);
            }
            if self
                .slot_ready
                .wait_until(&mut slots, self.deadline)
                .timed_out()
            {
                if let Some(result) = slots.results.get(ordinal).cloned().flatten() {
                    return Ok(result);
                }
                return Err(ItsError::timeout(
                    format!("capture result {} of batch {}", ordinal, self.id),
                    self.timeout,
                ));
            }
        }
    }

    fn on_result(&self, ordinal: usize, request: &CaptureRequest, result: CaptureResult) {
        if self.is_aborted() {
            trace!("Batch {} ignoring late result {}", self.id, ordinal);
            return;
        }
        debug!("Capture result {}: {}", ordinal, result.summary());

        let result = Arc::new(result);
        {
            let mut slots = self.slots.lock();
            match slots.results.get_mut(ordinal) {
                Some(slot) => *slot = Some(Arc::clone(&result)),
                None => {
                    drop(slots);
                    self.fail(ItsError::system(format!(
                        "result for unknown capture {}",
                        ordinal
                    )));
                    return;
                }
            }
        }
        self.slot_ready.notify_all();

        let outputs: Vec<Value> = self.outputs.iter().map(OutputSpec::to_json).collect();
        let body = json!({
            "cameraProperties": self.device.characteristics().to_json(),
            "captureRequest": request.to_json(),
            "captureResult": result.to_json(),
            "outputs": outputs,
        });
        match self
            .responses
            .send(Response::object(ResponseTag::CaptureResults, body))
        {
            Ok(()) => self.count_down(),
            Err(e) => self.fail(e),
        }
    }

    fn on_failed(&self, ordinal: usize, reason: &str) {
        if self.is_aborted() {
            return;
        }
        self.fail(
            DeviceError::CaptureFailed {
                frame_number: ordinal as u64,
                reason: reason.to_string(),
            }
            .into(),
        );
    }
}

fn packed(image: &Image) -> Result<Bytes> {
    image.packed_data().ok_or_else(|| {
        SessionError::UnexpectedImage {
            format: format!("{} with truncated planes", image.format.wire_name()),
        }
        .into()
    })
}

struct BatchImageListener {
    batch: Arc<CaptureBatch>,
    output_index: usize,
}

impl ImageListener for BatchImageListener {
    fn on_image_available(&self, image: Image) {
        self.batch.on_image(self.output_index, image);
    }
}

struct BatchResultListener {
    batch: Arc<CaptureBatch>,
    ordinal: usize,
}

impl CaptureListener for BatchResultListener {
    fn on_capture_completed(&self, request: &CaptureRequest, result: CaptureResult) {
        self.batch.on_result(self.ordinal, request, result);
    }

    fn on_capture_failed(&self, request: &CaptureRequest, reason: &str) {
        debug!("Capture {} failed for request {:?}", self.ordinal, request.template());
        self.batch.on_failed(self.ordinal, reason);
    }
}
