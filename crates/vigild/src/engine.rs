use crate::config::Config;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::{
    FaceDetect, FaceDetector, FaceEmbed, FaceRecognizer, FaceReport, ObjectDetect, ObjectDetector,
    Pipeline, PipelineError, XrayReport,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] vigil_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] vigil_core::recognizer::RecognizerError),
    #[error("object detector error: {0}")]
    Objects(#[from] vigil_core::objects::ObjectDetectorError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("request exceeded {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine started without workers")]
    NoWorkers,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One worker's private set of model collaborators.
pub struct Models {
    pub faces: Box<dyn FaceDetect + Send>,
    pub embedder: Box<dyn FaceEmbed + Send>,
    pub objects: Box<dyn ObjectDetect + Send>,
}

impl Models {
    /// Load all three ONNX models. Fails fast if any is unavailable.
    pub fn load(config: &Config) -> Result<Self, EngineError> {
        let faces = FaceDetector::load(&config.scrfd_model_path())?;
        let embedder = FaceRecognizer::load(&config.arcface_model_path())?;

        let labels = config.object_labels_path();
        if labels.is_none() {
            tracing::warn!(
                file = %config.object_labels.display(),
                "no class labels file; objects will be labelled by class index"
            );
        }
        let objects = ObjectDetector::load(
            &config.object_model_path(),
            labels.as_deref(),
            config.yolo_params(),
        )?;

        Ok(Self {
            faces: Box::new(faces),
            embedder: Box::new(embedder),
            objects: Box::new(objects),
        })
    }
}

/// Messages sent from HTTP handlers to an engine worker.
enum EngineRequest {
    Face {
        input: PathBuf,
        output: PathBuf,
        reply: oneshot::Sender<Result<FaceReport, PipelineError>>,
    },
    Xray {
        input: PathBuf,
        output: PathBuf,
        reply: oneshot::Sender<Result<XrayReport, PipelineError>>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
    next: Arc<AtomicUsize>,
    timeout: Duration,
}

impl EngineHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run the face path on `input`, writing the annotated copy to `output`.
    pub async fn face(&self, input: PathBuf, output: PathBuf) -> Result<FaceReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Face { input, output, reply }, rx).await
    }

    /// Run the X-ray path on `input`, writing the annotated copy to `output`.
    pub async fn xray(&self, input: PathBuf, output: PathBuf) -> Result<XrayReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Xray { input, output, reply }, rx).await
    }

    /// Round-robin the request to a worker and wait for its reply, bounded by the timeout.
    ///
    /// On timeout the worker still finishes the job; its reply is dropped.
    async fn dispatch<T>(
        &self,
        request: EngineRequest,
        rx: oneshot::Receiver<Result<T, PipelineError>>,
    ) -> Result<T, EngineError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];

        let round_trip = async {
            worker.send(request).await.map_err(|_| EngineError::ChannelClosed)?;
            let result = rx.await.map_err(|_| EngineError::ChannelClosed)?;
            Ok::<T, EngineError>(result?)
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    worker = index,
                    timeout = ?self.timeout,
                    "engine request timed out"
                );
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }
}

/// Spawn one dedicated OS thread per model set.
///
/// All workers share `pipeline` read-only; each owns its models exclusively.
pub fn spawn_engine(
    pipeline: Arc<Pipeline>,
    models: Vec<Models>,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    if models.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let mut workers = Vec::with_capacity(models.len());
    for (index, mut models) in models.into_iter().enumerate() {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
        let pipeline = Arc::clone(&pipeline);

        std::thread::Builder::new()
            .name(format!("vigil-engine-{index}"))
            .spawn(move || {
                tracing::info!(worker = index, "engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Face { input, output, reply } => {
                            let result = pipeline.run_face(
                                &input,
                                &output,
                                models.faces.as_mut(),
                                models.embedder.as_mut(),
                            );
                            let _ = reply.send(result);
                        }
                        EngineRequest::Xray { input, output, reply } => {
                            let result =
                                pipeline.run_xray(&input, &output, models.objects.as_mut());
                            let _ = reply.send(result);
                        }
                    }
                }
                tracing::info!(worker = index, "engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        workers.push(tx);
    }

    Ok(EngineHandle {
        workers: workers.into(),
        next: Arc::new(AtomicUsize::new(0)),
        timeout,
    })
}
