use crate::capability::{check_availability, SandboxHost, WasmtimeHost};
use crate::config::ClassifierConfig;
use crate::data_loader::ArtifactSource;
use crate::engine::{InferenceError, ModelRuntime, Session, SessionOptions, TensorMap};
use crate::errors::{ClassifierError, Result};
use crate::progress::DownloadProgress;
use imagenetpostprocessor::{classify, Classification, LabelSource, DEFAULT_TOP_K};
use imagenetpreprocessor::{preprocess_with_limit, ImageTensor, PreprocessError};
use ml_types::Tensor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Observable lifecycle position, without payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Init,
    Unsupported,
    Downloading,
    Loading,
    ModelError,
    Ready,
    InputReady,
    Inferring,
    Inferred,
    InferenceError,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Unsupported | Phase::ModelError)
    }
}

/// Outcome of one inference on the current input.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceResult {
    pub output: Tensor,
    pub class_index: usize,
    pub label: String,
    pub classifications: Vec<Classification>,
}

/// An uploaded image; `id` tells successive uploads apart.
#[derive(Clone, Debug)]
struct Input {
    id: u64,
    tensor: Arc<ImageTensor>,
}

/// Everything that exists at a given phase, and nothing more.
#[derive(Debug)]
enum State {
    Init,
    Unsupported,
    Downloading {
        pending: Option<Input>,
    },
    Loading {
        pending: Option<Input>,
    },
    ModelError {
        message: String,
    },
    Ready {
        session: Session,
    },
    InputReady {
        session: Session,
        input: Input,
    },
    Inferring {
        session: Session,
        input: Input,
    },
    Inferred {
        session: Session,
        input: Input,
        result: InferenceResult,
    },
    InferenceError {
        session: Session,
        input: Input,
        message: String,
    },
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Init => Phase::Init,
            State::Unsupported => Phase::Unsupported,
            State::Downloading { .. } => Phase::Downloading,
            State::Loading { .. } => Phase::Loading,
            State::ModelError { .. } => Phase::ModelError,
            State::Ready { .. } => Phase::Ready,
            State::InputReady { .. } => Phase::InputReady,
            State::Inferring { .. } => Phase::Inferring,
            State::Inferred { .. } => Phase::Inferred,
            State::InferenceError { .. } => Phase::InferenceError,
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            State::Ready { session }
            | State::InputReady { session, .. }
            | State::Inferring { session, .. }
            | State::Inferred { session, .. }
            | State::InferenceError { session, .. } => Some(session),
            _ => None,
        }
    }

    fn input(&self) -> Option<&Input> {
        match self {
            State::Downloading { pending } | State::Loading { pending } => pending.as_ref(),
            State::InputReady { input, .. }
            | State::Inferring { input, .. }
            | State::Inferred { input, .. }
            | State::InferenceError { input, .. } => Some(input),
            _ => None,
        }
    }
}

/// Drives capability check, download, model load, uploads and inference
/// through one lifecycle.
///
/// Inference calls are serialized: at most one `run()` is in flight against
/// the session at any time. The engine itself is guarded separately, so a run
/// that timed out keeps the engine until its work actually finishes and the
/// next run waits for it.
pub struct Orchestrator {
    config: ClassifierConfig,
    options: SessionOptions,
    top_k: usize,
    host: Arc<dyn SandboxHost>,
    source: Arc<dyn ArtifactSource>,
    runtime: Arc<dyn ModelRuntime>,
    labels: Arc<dyn LabelSource>,
    state: Mutex<State>,
    phase: watch::Sender<Phase>,
    progress: DownloadProgress,
    run_lock: Mutex<()>,
    engine_lock: Arc<Mutex<()>>,
    started: AtomicBool,
    next_input: AtomicU64,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: ClassifierConfig,
        source: Arc<dyn ArtifactSource>,
        runtime: Arc<dyn ModelRuntime>,
        labels: Arc<dyn LabelSource>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Init);

        Orchestrator {
            config,
            options: SessionOptions::default(),
            top_k: DEFAULT_TOP_K,
            host: Arc::new(WasmtimeHost),
            source,
            runtime,
            labels,
            state: Mutex::new(State::Init),
            phase,
            progress: DownloadProgress::new(),
            run_lock: Mutex::new(()),
            engine_lock: Arc::new(Mutex::new(())),
            started: AtomicBool::new(false),
            next_input: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sandbox_host(mut self, host: Arc<dyn SandboxHost>) -> Self {
        self.host = host;
        self
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Raw download progress, feed for a [`crate::progress::ProgressAnimator`].
    pub fn progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session().cloned()
    }

    /// The tensor the next `run()` would use, if any.
    pub async fn current_input(&self) -> Option<Arc<ImageTensor>> {
        self.state
            .lock()
            .await
            .input()
            .map(|input| Arc::clone(&input.tensor))
    }

    /// The result for the current input, if one was produced.
    pub async fn current_result(&self) -> Option<InferenceResult> {
        match &*self.state.lock().await {
            State::Inferred { result, .. } => Some(result.clone()),
            _ => None,
        }
    }

    /// Message of the last model or inference failure still in effect.
    pub async fn error_message(&self) -> Option<String> {
        match &*self.state.lock().await {
            State::ModelError { message } | State::InferenceError { message, .. } => {
                Some(message.clone())
            }
            _ => None,
        }
    }

    /// Run capability check, download and model load. Callable once.
    pub async fn start(&self) -> Result<Phase> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClassifierError::AlreadyStarted);
        }

        let host = Arc::clone(&self.host);
        let available = tokio::task::spawn_blocking(move || check_availability(host.as_ref()))
            .await
            .unwrap_or(false);

        info!(available, "sandbox capability checked");

        if !available {
            let mut state = self.state.lock().await;
            self.transition(&mut state, State::Unsupported);
            return Err(ClassifierError::UnsupportedEnvironment);
        }

        {
            let mut state = self.state.lock().await;
            self.transition(&mut state, State::Downloading { pending: None });
        }

        let progress = &self.progress;
        let model = match self
            .source
            .fetch(&mut |pct| progress.report(pct), &self.cancel)
            .await
        {
            Ok(model) => model,
            Err(error) => return Err(self.fail_model(error.into()).await),
        };

        info!("model of {} bytes downloaded, loading", model.len());

        {
            let mut state = self.state.lock().await;
            let pending = take_pending(&mut state);
            self.transition(&mut state, State::Loading { pending });
        }

        let session = match self.runtime.load(model, &self.options).await {
            Ok(session) => session,
            Err(error) => return Err(self.fail_model(ClassifierError::ModelLoad(error)).await),
        };

        info!(
            graph = session.graph,
            inputs = ?session.input_names,
            outputs = ?session.output_names,
            "model session ready"
        );

        let mut state = self.state.lock().await;
        let next = match take_pending(&mut state) {
            Some(input) => State::InputReady { session, input },
            None => State::Ready { session },
        };
        self.transition(&mut state, next);
        Ok(state.phase())
    }

    /// Preprocess `image` and make it the current input.
    ///
    /// A rejected or undecodable image leaves the previous input and result
    /// untouched.
    #[instrument(level = "debug", skip(self, image), fields(bytes = image.len()))]
    pub async fn upload(&self, image: Vec<u8>) -> Result<Phase> {
        let phase = self.phase();
        if matches!(phase, Phase::Init | Phase::Unsupported | Phase::ModelError) {
            return Err(ClassifierError::NotReady(phase));
        }

        let id = self.next_input.fetch_add(1, Ordering::SeqCst);
        let max_bytes = self.config.max_upload_bytes;
        let tensor = tokio::task::spawn_blocking(move || preprocess_with_limit(&image, max_bytes))
            .await
            .map_err(|e| {
                PreprocessError::ImageDecodeError(format!("preprocessing task failed: {}", e))
            })?
            .map_err(|error| {
                warn!(%error, "image rejected");
                ClassifierError::from(error)
            })?;

        let input = Input {
            id,
            tensor: Arc::new(tensor),
        };

        debug!(
            input = input.id,
            source = ?input.tensor.source_dimensions(),
            "image preprocessed"
        );

        let mut state = self.state.lock().await;
        self.apply_input(&mut state, input)
    }

    /// Classify the current input.
    ///
    /// Rejected without side effects unless both a session and an input
    /// exist. A result whose input was replaced meanwhile is discarded.
    #[instrument(level = "debug", skip(self))]
    pub async fn run(&self) -> Result<InferenceResult> {
        let _serial = self.run_lock.lock().await;

        let (session, input) = {
            let mut state = self.state.lock().await;
            let (session, input) = match &*state {
                State::InputReady { session, input }
                | State::Inferred { session, input, .. }
                | State::InferenceError { session, input, .. } => (session.clone(), input.clone()),
                other => return Err(ClassifierError::NotReady(other.phase())),
            };
            self.transition(
                &mut state,
                State::Inferring {
                    session: session.clone(),
                    input: input.clone(),
                },
            );
            (session, input)
        };

        let outcome = self.infer(&session, &input).await;

        let mut state = self.state.lock().await;
        let still_current =
            matches!(&*state, State::Inferring { input: running, .. } if running.id == input.id);
        if !still_current {
            warn!(input = input.id, "input replaced during inference, discarding result");
            return Err(ClassifierError::StaleResult);
        }

        match outcome {
            Ok(result) => {
                info!(
                    class_index = result.class_index,
                    label = %result.label,
                    "inference finished"
                );
                self.transition(
                    &mut state,
                    State::Inferred {
                        session,
                        input,
                        result: result.clone(),
                    },
                );
                Ok(result)
            }
            Err(error) => {
                error!(%error, "inference failed");
                self.transition(
                    &mut state,
                    State::InferenceError {
                        session,
                        input,
                        message: error.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    /// Abort an in-flight download and release the session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let session = self.state.lock().await.session().cloned();
        if let Some(session) = session {
            self.runtime.drop_session(&session).await;
        }
    }

    /// Make `input` current unless an upload that started later already won.
    fn apply_input(&self, state: &mut State, input: Input) -> Result<Phase> {
        if let Some(current) = state.input() {
            if current.id > input.id {
                debug!(
                    input = input.id,
                    current = current.id,
                    "newer upload already applied, dropping this one"
                );
                return Err(ClassifierError::Superseded);
            }
        }

        match &mut *state {
            State::Downloading { pending } | State::Loading { pending } => {
                *pending = Some(input);
                Ok(state.phase())
            }
            State::Ready { session }
            | State::InputReady { session, .. }
            | State::Inferring { session, .. }
            | State::Inferred { session, .. }
            | State::InferenceError { session, .. } => {
                let session = session.clone();
                self.transition(state, State::InputReady { session, input });
                Ok(Phase::InputReady)
            }
            other => Err(ClassifierError::NotReady(other.phase())),
        }
    }

    async fn infer(&self, session: &Session, input: &Input) -> Result<InferenceResult> {
        let input_name = session.primary_input().map_err(ClassifierError::Inference)?;
        let output_name = session.primary_output().map_err(ClassifierError::Inference)?;

        let tensor = input
            .tensor
            .to_tensor()
            .map_err(|e| ClassifierError::Inference(InferenceError::CorruptInputTensor(e)))?;
        let inputs = TensorMap::from([(input_name.to_string(), tensor)]);

        // The task owns the engine guard. A timeout detaches it, so the engine
        // stays held until the runtime returns.
        let engine_lock = Arc::clone(&self.engine_lock);
        let runtime = Arc::clone(&self.runtime);
        let running = session.clone();
        let work = tokio::spawn(async move {
            let _engine = engine_lock.lock_owned().await;
            runtime.run(&running, inputs).await
        });

        let limit = self.config.inference_timeout;
        let mut outputs = match tokio::time::timeout(limit, work).await {
            Err(_) => {
                warn!(?limit, "inference timed out, engine stays busy until it returns");
                return Err(ClassifierError::Inference(InferenceError::Timeout(limit)));
            }
            Ok(Err(join)) => {
                return Err(ClassifierError::Inference(InferenceError::RuntimeError(
                    format!("inference task failed: {}", join),
                )))
            }
            Ok(Ok(outputs)) => outputs.map_err(ClassifierError::Inference)?,
        };

        let output = outputs.remove(output_name).ok_or_else(|| {
            ClassifierError::Inference(InferenceError::MissingOutput(output_name.to_string()))
        })?;

        let prediction = classify(&output, self.labels.as_ref(), self.top_k)?;

        Ok(InferenceResult {
            output,
            class_index: prediction.class_index,
            label: prediction.label,
            classifications: prediction.classifications,
        })
    }

    async fn fail_model(&self, error: ClassifierError) -> ClassifierError {
        error!(%error, "model pipeline failed");
        let mut state = self.state.lock().await;
        self.transition(
            &mut state,
            State::ModelError {
                message: error.to_string(),
            },
        );
        error
    }

    fn transition(&self, state: &mut State, next: State) {
        let from = state.phase();
        *state = next;
        let to = state.phase();
        if from != to {
            debug!(?from, ?to, "phase transition");
        }
        self.phase.send_replace(to);
    }
}

fn take_pending(state: &mut State) -> Option<Input> {
    match state {
        State::Downloading { pending } | State::Loading { pending } => pending.take(),
        _ => None,
    }
}
