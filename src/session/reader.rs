use crossbeam::channel::{bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

use crate::device::{Image, ImageFormat, ImageSink, Surface, SurfaceId};
use crate::error::Result;

/// Consumer of images arriving at one reader. Runs on that reader's worker
/// thread, so a slow listener only delays its own reader.
pub trait ImageListener: Send + Sync {
    fn on_image_available(&self, image: Image);
}

/// Discards every image; used while 3A only cares about results
pub struct DroppingListener;

impl ImageListener for DroppingListener {
    fn on_image_available(&self, image: Image) {
        trace!(
            "Dropping {:?} image ({}x{}, ts {})",
            image.format,
            image.width,
            image.height,
            image.timestamp_ns
        );
    }
}

struct ReaderWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A bounded image queue for one output surface, drained by its own worker
pub struct ImageReader {
    id: SurfaceId,
    format: ImageFormat,
    width: u32,
    height: u32,
    sink: ImageSink,
    images: Receiver<Image>,
    worker: Option<ReaderWorker>,
}

impl ImageReader {
    pub fn new(id: SurfaceId, format: ImageFormat, width: u32, height: u32, max_images: usize) -> Self {
        let (tx, rx) = bounded(max_images);
        debug!(
            "Allocated {:?} reader {} ({}x{}, {} buffers)",
            format, id, width, height, max_images
        );
        Self {
            id,
            format,
            width,
            height,
            sink: ImageSink::new(tx),
            images: rx,
            worker: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Surface handle the device writes into
    pub fn surface(&self) -> Surface {
        Surface::new(self.id, self.format, self.width, self.height, self.sink.clone())
    }

    /// Start delivering queued and future images to `listener`, replacing
    /// any previous listener
    pub fn set_listener(&mut self, listener: Arc<dyn ImageListener>) -> Result<()> {
        self.stop_worker();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let images = self.images.clone();
        let id = self.id;
        let handle = thread::Builder::new()
            .name(format!("its-reader-{}", id))
            .spawn(move || loop {
                select! {
                    recv(images) -> message => match message {
                        Ok(image) => listener.on_image_available(image),
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })?;

        self.worker = Some(ReaderWorker {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the worker. A listener blocked mid-callback finishes on its own.
    pub fn close(&mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker.stop);
            if worker.handle.is_finished() && worker.handle.join().is_err() {
                warn!("Reader {} worker panicked", self.id);
            }
            trace!("Reader {} worker stopped", self.id);
        }
    }
}

impl Drop for ImageReader {
    fn drop(&mut self) {
        self.close();
    }
}
