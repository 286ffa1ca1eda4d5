//! Runtime - the command surface the front end talks to.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eigen_local::catalog::{discover_local_model, installed_paths, is_downloaded};
use eigen_local::download::verify_installed;
use eigen_local::{
    paths, ChatCompletionRequest, DownloadAccepted, DownloadManager, EventBus, LlamaCppClient,
    LlamaServerCommand, LocalModel, ModelCapabilities, ModelCatalog, ModelDescriptor,
    ModelListing, ModelRuntimeState, ReasoningSplitter, RuntimeEvent, ServerCommand,
    ServerHandle, ServerLaunch, ServerSupervisor, StreamError, LOCAL_MODEL_ID,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::prompt::{self, NewTurn, PromptWarning};
use crate::selection::SelectionStore;
use crate::session::{GenerationSession, GenerationSlot, SlotState};
use crate::store::{ChatStore, CompletedTurn, MemoryChatStore, TurnOutcome};

/// Accepted `chat_stream` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatStreamStarted {
    pub warnings: Vec<PromptWarning>,
}

/// Local inference runtime.
///
/// Cheap to clone; every clone drives the same server, downloads and
/// generation slot.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    catalog: ModelCatalog,
    events: EventBus,
    downloads: DownloadManager,
    supervisor: ServerSupervisor,
    slot: GenerationSlot,
    current: Mutex<Option<String>>,
    selection: SelectionStore,
    store: Arc<dyn ChatStore>,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    catalog: Option<ModelCatalog>,
    command: Option<Arc<dyn ServerCommand>>,
    store: Option<Arc<dyn ChatStore>>,
}

impl RuntimeBuilder {
    /// Use `catalog` instead of the one under the models directory.
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the llama-server command line.
    pub fn server_command(mut self, command: Arc<dyn ServerCommand>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn chat_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Create the data directories, load the catalog and assemble the runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        paths::ensure_dirs(&config.data_dir)?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ModelCatalog::load_or_create(&config.catalog_path())?,
        };
        let command: Arc<dyn ServerCommand> = match self.command {
            Some(command) => command,
            None => Arc::new(
                LlamaServerCommand::new(&config.server_binary)
                    .with_ctx_size(config.context_length)
                    .with_n_predict(config.max_tokens),
            ),
        };
        let store: Arc<dyn ChatStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryChatStore::new()),
        };

        let events = EventBus::new(config.event_capacity);
        let mut supervisor = ServerSupervisor::new(command, events.clone())
            .with_startup_timeout(config.startup_timeout)
            .with_shutdown_grace(config.shutdown_grace)
            .with_health_interval(config.health_interval);
        if let Some(port) = config.port {
            supervisor = supervisor.with_port(port);
        }
        let downloads = DownloadManager::with_timings(
            config.models_dir(),
            events.clone(),
            config.progress_interval,
            config.download_idle_timeout,
        );

        info!(
            "Runtime ready with {} catalog models in {}",
            catalog.descriptors().len(),
            config.data_dir.display()
        );
        Ok(Runtime {
            inner: Arc::new(Inner {
                selection: SelectionStore::new(config.selection_path()),
                config,
                catalog,
                events,
                downloads,
                supervisor,
                slot: GenerationSlot::new(),
                current: Mutex::new(None),
                store,
            }),
        })
    }
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            catalog: None,
            command: None,
            store: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    /// Subscribe to runtime events.
    pub fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Every catalog model with its on-disk and runtime state.
    ///
    /// A model placed by hand in the models directory is listed first.
    pub fn list_models(&self) -> Vec<ModelListing> {
        let models_dir = self.inner.config.models_dir();
        let current = self.current_model();
        let state_for = |id: &str| -> ModelRuntimeState {
            if current.as_deref() == Some(id) {
                ModelRuntimeState::Current
            } else {
                ModelRuntimeState::Downloaded
            }
        };

        let local = self.local_model().map(|local| ModelListing {
            state: state_for(LOCAL_MODEL_ID),
            descriptor: local.descriptor,
            download_percent: None,
        });
        let catalog = self.inner.catalog.descriptors().iter().map(|descriptor| {
            let job = self.inner.downloads.job(&descriptor.id);
            let state = if job.is_some() {
                ModelRuntimeState::Downloading
            } else if !is_downloaded(&models_dir, descriptor) {
                ModelRuntimeState::NotDownloaded
            } else {
                state_for(descriptor.id.as_str())
            };
            ModelListing {
                descriptor: descriptor.clone(),
                state,
                download_percent: job.map(|job| job.percent()),
            }
        });
        local.into_iter().chain(catalog).collect()
    }

    pub fn download_model(&self, model_id: &str) -> Result<DownloadAccepted, RuntimeError> {
        if self.is_local(model_id) {
            return Ok(DownloadAccepted::AlreadyDownloaded);
        }
        let descriptor = self.descriptor(model_id)?;
        Ok(self.inner.downloads.start(descriptor))
    }

    /// Cancel the download of `model_id`, if any.
    pub fn cancel_download(&self, model_id: &str) {
        if !self.inner.downloads.cancel(model_id) {
            debug!("No download of {} to cancel", model_id);
        }
    }

    /// Remove a downloaded model from disk.
    ///
    /// Holds the switch slot while deleting, so it is refused while a
    /// switch, boot or generation is running.
    pub async fn delete_model(&self, model_id: &str) -> Result<(), RuntimeError> {
        if self.is_local(model_id) {
            debug!("Refusing to delete hand-placed model");
            return Err(RuntimeError::NotManaged(model_id.to_string()));
        }
        let descriptor = self.descriptor(model_id)?;
        let _guard = self.inner.slot.reserve_switch().map_err(|e| {
            debug!("Delete of {} rejected: {}", model_id, e);
            e
        })?;
        if self.current_model().as_deref() == Some(model_id) {
            debug!("Refusing to delete current model {}", model_id);
            return Err(RuntimeError::InUse(model_id.to_string()));
        }
        if self.inner.downloads.is_downloading(model_id) {
            debug!("Refusing to delete {} while downloading", model_id);
            return Err(RuntimeError::Busy("the model is downloading"));
        }

        let dir = paths::model_dir(&self.inner.config.models_dir(), &descriptor.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Deleted model {}", model_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Load `model_id` into the inference server.
    ///
    /// Refused while a generation is running. If the new model fails to
    /// start, the previous one is relaunched.
    pub async fn switch_model(&self, model_id: &str) -> Result<(), RuntimeError> {
        let _guard = self.inner.slot.reserve_switch().map_err(|e| {
            debug!("Switch to {} rejected: {}", model_id, e);
            e
        })?;
        let launch = self.launch_for(model_id)?;

        let previous = self.current_model();
        let loaded = self.inner.supervisor.status();
        if previous.as_deref() == Some(model_id)
            && loaded.is_some_and(|h| h.is_ready() && h.model_id == model_id)
        {
            debug!("Model {} is already loaded", model_id);
            return Ok(());
        }

        info!("Switching model to {}", model_id);
        match self.inner.supervisor.restart_with(launch).await {
            Ok(_) => {
                self.set_current(Some(model_id.to_string()));
                self.persist_selection(model_id).await;
                Ok(())
            }
            Err(e) => {
                warn!("Switch to {} failed: {}", model_id, e);
                self.restore(previous.filter(|id| id != model_id)).await;
                Err(e.into())
            }
        }
    }

    /// True if the server is up and healthy.
    pub fn model_status(&self) -> bool {
        self.inner.supervisor.is_ready()
    }

    /// The model marked current, loaded or not.
    pub fn current_model(&self) -> Option<String> {
        self.current().clone()
    }

    pub fn server_status(&self) -> Option<ServerHandle> {
        self.inner.supervisor.status()
    }

    pub fn generation_state(&self) -> SlotState {
        self.inner.slot.state()
    }

    /// Start generating a reply in `chat_id`.
    ///
    /// Returns once the request is accepted; the reply arrives as
    /// `generation-*` events ending in exactly one `generation-end` or
    /// `generation-error`.
    pub async fn chat_stream(
        &self,
        chat_id: &str,
        turn: NewTurn,
    ) -> Result<ChatStreamStarted, RuntimeError> {
        let session = self.inner.slot.begin(chat_id).map_err(|e| {
            debug!("Generation for {} rejected: {}", chat_id, e);
            e
        })?;

        let prepared = self.prepare(chat_id, &turn).await;
        let (client, request, instance, warnings) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.slot.release(&session);
                return Err(e);
            }
        };

        self.inner.events.publish(RuntimeEvent::GenerationBegin {
            chat_id: chat_id.to_string(),
        });
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .run_generation(session, client, request, instance)
                .await
        });

        Ok(ChatStreamStarted { warnings })
    }

    /// Stop the running generation. Returns false if none was running.
    pub fn cancel_generation(&self) -> bool {
        self.inner.slot.cancel()
    }

    /// Ask the loaded model for a short title for a chat opening with `text`.
    pub async fn suggest_title(&self, text: &str) -> Result<String, RuntimeError> {
        let handle = self.ready_server()?;
        let request = ChatCompletionRequest::new(prompt::title_messages(text), prompt::TITLE_MAX_TOKENS)
            .with_temperature(0.3);
        let raw = LlamaCppClient::with_url(handle.endpoint)
            .complete(&request)
            .await?;
        Ok(prompt::clean_title(&raw))
    }

    /// Load the startup model.
    ///
    /// Tries the saved selection, then the preferred model, then the first
    /// installed model in catalog order, then a hand-placed model. Publishes `model-no-model-available`
    /// and returns `None` if nothing is installed.
    pub async fn boot(&self) -> Result<Option<String>, RuntimeError> {
        let _guard = self.inner.slot.reserve_switch()?;
        if let Some(handle) = self.inner.supervisor.status().filter(ServerHandle::is_ready) {
            return Ok(Some(handle.model_id));
        }

        let Some(model_id) = self.startup_model().await else {
            info!("No downloaded model to load");
            self.inner.events.publish(RuntimeEvent::ModelNoModelAvailable);
            return Ok(None);
        };

        let launch = self.launch_for(&model_id)?;
        self.inner.supervisor.start(launch).await?;
        self.set_current(Some(model_id.clone()));
        self.persist_selection(&model_id).await;
        Ok(Some(model_id))
    }

    /// Cancel everything in flight and stop the server.
    pub async fn shutdown(&self) {
        info!("Shutting down runtime");
        self.inner.slot.cancel();
        self.inner.downloads.cancel_all();
        self.inner.supervisor.stop().await;
    }

    fn descriptor(&self, model_id: &str) -> Result<&ModelDescriptor, RuntimeError> {
        self.inner
            .catalog
            .get(model_id)
            .ok_or_else(|| RuntimeError::NotFound(model_id.to_string()))
    }

    /// The hand-placed model, if the models directory holds one.
    fn local_model(&self) -> Option<LocalModel> {
        discover_local_model(&self.inner.config.models_dir())
    }

    fn is_local(&self, model_id: &str) -> bool {
        model_id == LOCAL_MODEL_ID && self.local_model().is_some()
    }

    fn capabilities(&self, model_id: &str) -> ModelCapabilities {
        if model_id == LOCAL_MODEL_ID {
            return self
                .local_model()
                .map(|local| local.descriptor.capabilities)
                .unwrap_or_default();
        }
        self.inner
            .catalog
            .get(model_id)
            .map(|descriptor| descriptor.capabilities)
            .unwrap_or_default()
    }

    fn launch_for(&self, model_id: &str) -> Result<ServerLaunch, RuntimeError> {
        if model_id == LOCAL_MODEL_ID {
            let local = self
                .local_model()
                .ok_or_else(|| RuntimeError::NotFound(model_id.to_string()))?;
            return Ok(ServerLaunch {
                model_id: model_id.to_string(),
                paths: local.paths,
            });
        }
        let descriptor = self.descriptor(model_id)?;
        let paths = installed_paths(&self.inner.config.models_dir(), descriptor)
            .ok_or_else(|| RuntimeError::NotDownloaded(model_id.to_string()))?;
        Ok(ServerLaunch {
            model_id: model_id.to_string(),
            paths,
        })
    }

    fn ready_server(&self) -> Result<ServerHandle, RuntimeError> {
        self.inner
            .supervisor
            .status()
            .filter(ServerHandle::is_ready)
            .ok_or(RuntimeError::NotReady)
    }

    fn current(&self) -> MutexGuard<'_, Option<String>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_current(&self, model_id: Option<String>) {
        *self.current() = model_id;
    }

    async fn persist_selection(&self, model_id: &str) {
        if let Err(e) = self.inner.selection.save(model_id).await {
            warn!("Failed to save model selection: {}", e);
        }
    }

    /// Relaunch `previous` after a failed switch.
    async fn restore(&self, previous: Option<String>) {
        let Some(previous) = previous else {
            self.set_current(None);
            return;
        };
        let relaunched = match self.launch_for(&previous) {
            Ok(launch) => self.inner.supervisor.start(launch).await.map_err(RuntimeError::from),
            Err(e) => Err(e),
        };
        match relaunched {
            Ok(_) => info!("Restored model {}", previous),
            Err(e) => {
                warn!("Failed to restore model {}: {}", previous, e);
                self.set_current(None);
            }
        }
    }

    async fn startup_model(&self) -> Option<String> {
        let models_dir = self.inner.config.models_dir();

        if let Some(saved) = self.inner.selection.load().await {
            let valid = match self.inner.catalog.get(&saved.model_id) {
                Some(descriptor) => verify_installed(&models_dir, descriptor)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Failed to verify {}: {}", saved.model_id, e);
                        false
                    }),
                None => self.is_local(&saved.model_id),
            };
            if valid {
                return Some(saved.model_id);
            }
            warn!("Saved model {} is no longer usable", saved.model_id);
            if let Err(e) = self.inner.selection.clear().await {
                warn!("Failed to clear model selection: {}", e);
            }
        }

        let installed = |id: &str| {
            self.is_local(id)
                || self
                    .inner
                    .catalog
                    .get(id)
                    .is_some_and(|descriptor| is_downloaded(&models_dir, descriptor))
        };
        if let Some(preferred) = &self.inner.config.preferred_model {
            if installed(preferred.as_str()) {
                return Some(preferred.clone());
            }
            debug!("Preferred model {} is not downloaded", preferred);
        }
        let first_installed = self
            .inner
            .catalog
            .descriptors()
            .iter()
            .find(|descriptor| installed(descriptor.id.as_str()))
            .map(|descriptor| descriptor.id.clone());
        if first_installed.is_some() {
            return first_installed;
        }
        self.local_model().map(|local| {
            info!("Falling back to hand-placed model {}", local.paths.model.display());
            local.descriptor.id
        })
    }

    async fn prepare(
        &self,
        chat_id: &str,
        turn: &NewTurn,
    ) -> Result<(LlamaCppClient, ChatCompletionRequest, u64, Vec<PromptWarning>), RuntimeError>
    {
        let handle = self.ready_server()?;
        let capabilities = self.capabilities(&handle.model_id);

        let config = &self.inner.config;
        let history = self.inner.store.history(chat_id).await?;
        let formatted = prompt::build_prompt(
            &history,
            turn,
            &config.system_prompt,
            &capabilities,
            config.history_limit,
        );
        for warning in &formatted.warnings {
            warn!("{}", warning);
        }
        self.inner
            .store
            .append_user_turn(chat_id, turn.to_chat_turn())
            .await?;

        let client =
            LlamaCppClient::with_url(handle.endpoint).with_idle_timeout(config.stream_idle_timeout);
        let request = ChatCompletionRequest::new(formatted.messages, config.max_tokens).streaming();
        Ok((client, request, handle.instance, formatted.warnings))
    }
}

impl Inner {
    async fn run_generation(
        &self,
        mut session: GenerationSession,
        client: LlamaCppClient,
        request: ChatCompletionRequest,
        instance: u64,
    ) {
        let mut health = self.supervisor.subscribe();
        let result = self
            .generate(&mut session, &client, &request, &mut health, instance)
            .await;
        let elapsed_ms = session.elapsed_ms();

        match result {
            Ok(outcome) => {
                debug!(
                    "Generation for {} ended ({:?}) after {}ms",
                    session.chat_id, outcome, elapsed_ms
                );
                let turn = CompletedTurn {
                    chat_id: session.chat_id.clone(),
                    content: session.content.clone(),
                    reasoning: session.reasoning.clone(),
                    elapsed_ms,
                    outcome,
                };
                if let Err(e) = self.store.complete_turn(turn).await {
                    warn!("Failed to store reply for {}: {}", session.chat_id, e);
                }
                self.slot.release(&session);
                self.events.publish(RuntimeEvent::GenerationEnd {
                    chat_id: session.chat_id,
                    elapsed_ms,
                    content: session.content,
                    reasoning: session.reasoning,
                });
            }
            Err(e) => {
                warn!("Generation for {} failed: {}", session.chat_id, e);
                self.slot.release(&session);
                self.events.publish(RuntimeEvent::GenerationError {
                    chat_id: session.chat_id,
                    message: e.to_string(),
                    elapsed_ms,
                });
            }
        }
    }

    async fn generate(
        &self,
        session: &mut GenerationSession,
        client: &LlamaCppClient,
        request: &ChatCompletionRequest,
        health: &mut watch::Receiver<Option<ServerHandle>>,
        instance: u64,
    ) -> Result<TurnOutcome, StreamError> {
        let cancel = session.cancel_token().clone();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnOutcome::Cancelled),
            _ = server_lost(health, instance) => return Err(StreamError::ServerExited),
            opened = client.stream_chat(request) => opened?,
        };

        let mut splitter = ReasoningSplitter::new();
        loop {
            let fragment = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnOutcome::Cancelled),
                _ = server_lost(health, instance) => return Err(StreamError::ServerExited),
                next = stream.next_fragment() => next,
            };
            match fragment {
                Some(Ok(text)) => {
                    let delta = splitter.push(&text);
                    self.emit_delta(session, delta);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        let tail = splitter.finish();
        self.emit_delta(session, tail);
        Ok(TurnOutcome::Completed)
    }

    fn emit_delta(&self, session: &mut GenerationSession, delta: eigen_local::Delta) {
        if delta.is_empty() {
            return;
        }
        session.apply(&delta);
        self.events.publish(RuntimeEvent::GenerationDelta {
            chat_id: session.chat_id.clone(),
            content: delta.content,
            reasoning: delta.reasoning,
        });
    }
}

/// Resolves once server `instance` is no longer ready.
async fn server_lost(health: &mut watch::Receiver<Option<ServerHandle>>, instance: u64) {
    loop {
        let alive = health
            .borrow_and_update()
            .as_ref()
            .is_some_and(|h| h.instance == instance && h.is_ready());
        if !alive || health.changed().await.is_err() {
            return;
        }
    }
}
