//! Background thread for batch augmentation.
//!
//! `BatchRunner` owns one worker thread. Jobs are processed strictly one at
//! a time in submission order. Cancellation is cooperative: it is checked
//! before each job starts, never while a job is running.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::augment::{self, AugmentConfig};
use crate::error::AugmentError;
use crate::model::{AnnotationId, ImageId, ImageRecord};

/// Identifier of a submitted job.
pub type JobId = u64;

/// One queued augmentation.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: JobId,
    pub source: ImageRecord,
    pub config: AugmentConfig,
    /// Id given to the produced image record
    pub output_id: ImageId,
}

/// What a finished job produced.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub record: ImageRecord,
    pub dropped: Vec<AnnotationId>,
}

/// Progress reported by the worker.
#[derive(Debug)]
pub enum BatchEvent {
    Started {
        job: JobId,
        image_id: ImageId,
    },
    Completed {
        job: JobId,
        image_id: ImageId,
        output: JobOutput,
    },
    Failed {
        job: JobId,
        image_id: ImageId,
        error: AugmentError,
    },
    /// Skipped because the batch was cancelled before it started
    Cancelled {
        job: JobId,
        image_id: ImageId,
    },
    /// The queue has drained
    Finished,
}

impl BatchEvent {
    /// Source image of a job-terminal event.
    fn finished_image(&self) -> Option<ImageId> {
        match self {
            BatchEvent::Completed { image_id, .. }
            | BatchEvent::Failed { image_id, .. }
            | BatchEvent::Cancelled { image_id, .. } => Some(*image_id),
            BatchEvent::Started { .. } | BatchEvent::Finished => None,
        }
    }
}

/// Message sent to the worker thread.
enum WorkerMessage {
    Run(Box<BatchJob>),
    Shutdown,
}

/// Turns a job into its output. The default runs [`augment::apply`].
pub type Processor = Box<dyn FnMut(&BatchJob) -> Result<JobOutput, AugmentError> + Send>;

/// Augment a job's source record with the real engine.
pub fn augment_job(job: &BatchJob) -> Result<JobOutput, AugmentError> {
    let output = augment::apply(&job.source.blob, &job.config, &job.source.annotations)?;
    let mut record = ImageRecord::new(job.output_id, output.blob, output.width, output.height);
    record.annotations = output.annotations;
    Ok(JobOutput {
        record,
        dropped: output.dropped,
    })
}

/// Manages the batch augmentation thread.
pub struct BatchRunner {
    request_tx: Sender<WorkerMessage>,
    event_rx: Receiver<BatchEvent>,
    thread_handle: Option<JoinHandle<()>>,
    next_job: JobId,
    /// Jobs with an id below this are cancelled when reached
    cancel_below: Arc<AtomicU64>,
    /// Source images with a job queued or running
    in_flight: HashSet<ImageId>,
}

impl BatchRunner {
    /// Spawn a runner that uses the augmentation engine.
    pub fn spawn() -> Result<Self, AugmentError> {
        Self::spawn_with(Box::new(augment_job))
    }

    /// Spawn a runner with a custom job processor.
    pub fn spawn_with(processor: Processor) -> Result<Self, AugmentError> {
        let (request_tx, request_rx) = mpsc::channel::<WorkerMessage>();
        let (event_tx, event_rx) = mpsc::channel::<BatchEvent>();
        let cancel_below = Arc::new(AtomicU64::new(0));
        let worker_cancel = Arc::clone(&cancel_below);

        let thread_handle = thread::Builder::new()
            .name("batch-augment".to_string())
            .spawn(move || {
                log::info!("Batch augmentation thread started");
                Self::thread_loop(request_rx, event_tx, worker_cancel, processor);
                log::info!("Batch augmentation thread exiting");
            })
            .map_err(|e| AugmentError::WorkerUnavailable(format!("failed to spawn thread: {}", e)))?;

        Ok(Self {
            request_tx,
            event_rx,
            thread_handle: Some(thread_handle),
            next_job: 0,
            cancel_below,
            in_flight: HashSet::new(),
        })
    }

    fn thread_loop(
        request_rx: Receiver<WorkerMessage>,
        event_tx: Sender<BatchEvent>,
        cancel_below: Arc<AtomicU64>,
        mut processor: Processor,
    ) {
        let mut queue: VecDeque<Box<BatchJob>> = VecDeque::new();
        let mut running = false;
        loop {
            loop {
                match request_rx.try_recv() {
                    Ok(WorkerMessage::Run(job)) => queue.push_back(job),
                    Ok(WorkerMessage::Shutdown) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => break,
                }
            }

            let Some(job) = queue.pop_front() else {
                if running {
                    running = false;
                    if event_tx.send(BatchEvent::Finished).is_err() {
                        return;
                    }
                }
                match request_rx.recv() {
                    Ok(WorkerMessage::Run(job)) => {
                        queue.push_back(job);
                        continue;
                    }
                    Ok(WorkerMessage::Shutdown) | Err(_) => return,
                }
            };
            running = true;

            let image_id = job.source.id;
            let event = if job.id < cancel_below.load(Ordering::Acquire) {
                log::debug!("Batch job {} for image {} cancelled", job.id, image_id);
                BatchEvent::Cancelled {
                    job: job.id,
                    image_id,
                }
            } else {
                if event_tx
                    .send(BatchEvent::Started {
                        job: job.id,
                        image_id,
                    })
                    .is_err()
                {
                    return;
                }
                match processor(&job) {
                    Ok(output) => {
                        log::debug!(
                            "Batch job {} for image {} done, {} annotation(s) dropped",
                            job.id,
                            image_id,
                            output.dropped.len()
                        );
                        BatchEvent::Completed {
                            job: job.id,
                            image_id,
                            output,
                        }
                    }
                    Err(error) => {
                        log::warn!("Batch job {} for image {} failed: {}", job.id, image_id, error);
                        BatchEvent::Failed {
                            job: job.id,
                            image_id,
                            error,
                        }
                    }
                }
            };
            if event_tx.send(event).is_err() {
                log::warn!("Event channel closed, batch thread exiting");
                return;
            }
        }
    }

    /// Queue an augmentation of `source`. Refused while another job for the
    /// same source image is queued or running.
    pub fn submit(
        &mut self,
        source: ImageRecord,
        config: AugmentConfig,
        output_id: ImageId,
    ) -> Result<JobId, AugmentError> {
        if self.in_flight.contains(&source.id) {
            return Err(AugmentError::Busy {
                image_id: source.id,
            });
        }
        let id = self.next_job;
        let image_id = source.id;
        let job = BatchJob {
            id,
            source,
            config,
            output_id,
        };
        self.request_tx
            .send(WorkerMessage::Run(Box::new(job)))
            .map_err(|_| AugmentError::WorkerUnavailable("batch thread has exited".into()))?;
        self.next_job += 1;
        self.in_flight.insert(image_id);
        log::debug!("Queued batch job {} for image {}", id, image_id);
        Ok(id)
    }

    /// Cancel every job submitted so far that has not started yet. A job
    /// already running finishes normally.
    pub fn cancel(&self) {
        self.cancel_below.store(self.next_job, Ordering::Release);
        log::info!("Batch cancelled ({} job(s) submitted)", self.next_job);
    }

    /// Take one event if available. Non-blocking.
    pub fn poll(&mut self) -> Option<BatchEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(self.observe(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::warn!("Batch thread disconnected");
                None
            }
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn wait_event(&mut self, timeout: Duration) -> Option<BatchEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(self.observe(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Batch thread disconnected");
                None
            }
        }
    }

    fn observe(&mut self, event: BatchEvent) -> BatchEvent {
        if let Some(image_id) = event.finished_image() {
            self.in_flight.remove(&image_id);
        }
        event
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_pending(&self, image_id: ImageId) -> bool {
        self.in_flight.contains(&image_id)
    }
}

impl Drop for BatchRunner {
    fn drop(&mut self) {
        log::debug!("Shutting down batch augmentation thread");
        let _ = self.request_tx.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                log::warn!("Batch thread panicked: {:?}", e);
            }
        }
    }
}
