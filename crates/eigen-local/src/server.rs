//! Process supervisor for llama-server.
//!
//! The supervisor is the only component that starts or kills the inference
//! process. A monitor task owns each child; the rest of the system observes
//! the server through [`ServerHandle`] snapshots published on a watch channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::catalog::ModelPaths;
use crate::client::LlamaCppClient;
use crate::error::{describe_exit, StartError};
use crate::events::{EventBus, RuntimeEvent, SwitchStatus};

/// Default bound on waiting for `/health` after spawn.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time allowed between SIGTERM and a forced kill.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Default interval between health checks during startup.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(500);

/// Health of the inference server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Ready,
    Error,
    Stopped,
}

/// Read-only snapshot of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHandle {
    /// Increases with every launch; identifies one process lifetime.
    pub instance: u64,
    pub pid: Option<u32>,
    pub endpoint: String,
    pub model_id: String,
    pub health: HealthState,
}

impl ServerHandle {
    pub fn is_ready(&self) -> bool {
        self.health == HealthState::Ready
    }
}

/// What to load into the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLaunch {
    pub model_id: String,
    pub paths: ModelPaths,
}

/// Builds the process for a launch.
pub trait ServerCommand: Send + Sync {
    /// Command that serves `launch` on `127.0.0.1:<port>`.
    fn build(&self, launch: &ServerLaunch, port: u16) -> Result<Command, StartError>;
}

/// The real llama-server binary.
#[derive(Debug, Clone)]
pub struct LlamaServerCommand {
    binary: PathBuf,
    ctx_size: u32,
    n_predict: u32,
    extra_args: Vec<String>,
}

impl LlamaServerCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ctx_size: 8192,
            n_predict: 4096,
            extra_args: Vec::new(),
        }
    }

    /// Context window passed as `--ctx-size`.
    pub fn with_ctx_size(mut self, ctx_size: u32) -> Self {
        self.ctx_size = ctx_size;
        self
    }

    /// Token limit passed as `--n-predict`.
    pub fn with_n_predict(mut self, n_predict: u32) -> Self {
        self.n_predict = n_predict;
        self
    }

    /// Append raw arguments after the generated ones.
    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// Path of the llama-server executable.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments passed to llama-server, in order.
    pub fn args(&self, launch: &ServerLaunch, port: u16) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            launch.paths.model.display().to_string(),
        ];
        if let Some(mmproj) = &launch.paths.mmproj {
            args.push("--mmproj".to_string());
            args.push(mmproj.display().to_string());
        }
        args.extend([
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--ctx-size".to_string(),
            self.ctx_size.to_string(),
            "--n-predict".to_string(),
            self.n_predict.to_string(),
            // Reasoning stays inline so <think> tags reach the splitter.
            "--reasoning-format".to_string(),
            "none".to_string(),
        ]);
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl ServerCommand for LlamaServerCommand {
    fn build(&self, launch: &ServerLaunch, port: u16) -> Result<Command, StartError> {
        if !self.binary.exists() {
            return Err(StartError::BinaryNotFound(
                self.binary.display().to_string(),
            ));
        }
        let mut command = Command::new(&self.binary);
        command.args(self.args(launch, port));
        Ok(command)
    }
}

struct RunningServer {
    handle: ServerHandle,
    stop: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Everything the monitor task needs after spawn.
struct Monitor {
    status: Arc<watch::Sender<Option<ServerHandle>>>,
    events: EventBus,
    instance: u64,
    model_id: String,
    grace: Duration,
}

/// Supervisor for the llama-server process.
///
/// Dropping the supervisor stops its process.
pub struct ServerSupervisor {
    command: Arc<dyn ServerCommand>,
    events: EventBus,
    port: Option<u16>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
    health_interval: Duration,
    running: Mutex<Option<RunningServer>>,
    status: Arc<watch::Sender<Option<ServerHandle>>>,
    instances: AtomicU64,
}

impl ServerSupervisor {
    pub fn new(command: Arc<dyn ServerCommand>, events: EventBus) -> Self {
        let (status, _) = watch::channel(None);
        Self {
            command,
            events,
            port: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            running: Mutex::new(None),
            status: Arc::new(status),
            instances: AtomicU64::new(0),
        }
    }

    /// Use a fixed port instead of an ephemeral one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// How long `start` waits for a healthy server.
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Time between SIGTERM and a forced kill.
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Delay between health polls while starting.
    pub fn with_health_interval(mut self, health_interval: Duration) -> Self {
        self.health_interval = health_interval;
        self
    }

    /// Latest snapshot, `None` before the first launch.
    pub fn status(&self) -> Option<ServerHandle> {
        self.status.borrow().clone()
    }

    /// Watch every health transition.
    pub fn subscribe(&self) -> watch::Receiver<Option<ServerHandle>> {
        self.status.subscribe()
    }

    /// True if a server is running and answered its health check.
    pub fn is_ready(&self) -> bool {
        self.status.borrow().as_ref().is_some_and(ServerHandle::is_ready)
    }

    /// Launch the server and wait until it is healthy.
    pub async fn start(&self, launch: ServerLaunch) -> Result<ServerHandle, StartError> {
        let mut running = self.running.lock().await;
        match running.as_ref() {
            // A crashed server only needs its bookkeeping cleared.
            Some(current) if current.monitor.is_finished() => {
                self.stop_locked(&mut running).await
            }
            Some(_) => return Err(StartError::AlreadyRunning),
            None => {}
        }
        self.launch_locked(&mut running, launch).await
    }

    /// Stop the server. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await;
    }

    /// Replace whatever is running with `launch`.
    ///
    /// The lock is held across stop and start, so two servers never overlap.
    pub async fn restart_with(&self, launch: ServerLaunch) -> Result<ServerHandle, StartError> {
        let mut running = self.running.lock().await;
        let model_id = launch.model_id.clone();

        self.publish_switch(&model_id, SwitchStatus::Stopping, None);
        self.stop_locked(&mut running).await;

        self.publish_switch(&model_id, SwitchStatus::Starting, None);
        match self.launch_locked(&mut running, launch).await {
            Ok(handle) => {
                self.publish_switch(&model_id, SwitchStatus::Ready, None);
                Ok(handle)
            }
            Err(e) => {
                self.publish_switch(&model_id, SwitchStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn publish_switch(&self, model_id: &str, status: SwitchStatus, error: Option<String>) {
        self.events.publish(RuntimeEvent::ModelSwitching {
            model_id: model_id.to_string(),
            status,
            error,
        });
    }

    async fn launch_locked(
        &self,
        slot: &mut Option<RunningServer>,
        launch: ServerLaunch,
    ) -> Result<ServerHandle, StartError> {
        let instance = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        let model_id = launch.model_id.clone();
        self.events.publish(RuntimeEvent::ModelLoading {
            model_id: model_id.clone(),
        });

        match self.spawn_and_wait(instance, &launch).await {
            Ok(running) => {
                let handle = running.handle.clone();
                info!(
                    "llama-server is ready at {} with model {}",
                    handle.endpoint, model_id
                );
                *slot = Some(running);
                self.events.publish(RuntimeEvent::ModelReady { model_id });
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to start llama-server for {}: {}", model_id, e);
                self.status.send_modify(|status| match status {
                    Some(handle) if handle.instance == instance => {
                        handle.health = HealthState::Error
                    }
                    _ => *status = None,
                });
                self.events.publish(RuntimeEvent::ModelError {
                    model_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        instance: u64,
        launch: &ServerLaunch,
    ) -> Result<RunningServer, StartError> {
        let model_files = std::iter::once(&launch.paths.model).chain(&launch.paths.mmproj);
        for path in model_files {
            if !path.is_file() {
                return Err(StartError::ModelMissing(path.display().to_string()));
            }
        }

        let port = self.resolve_port()?;
        let mut command = self.command.build(launch, port)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            "Starting llama-server on port {} with model {}",
            port, launch.model_id
        );
        let mut child = command
            .spawn()
            .map_err(|e| StartError::Spawn(e.to_string()))?;
        let pid = child.id();
        debug!("llama-server process started with PID: {:?}", pid);

        forward_output(child.stdout.take(), "stdout");
        forward_output(child.stderr.take(), "stderr");

        let mut handle = ServerHandle {
            instance,
            pid,
            endpoint: format!("http://127.0.0.1:{}", port),
            model_id: launch.model_id.clone(),
            health: HealthState::Starting,
        };
        self.status.send_replace(Some(handle.clone()));

        let (stop, stop_rx) = oneshot::channel();
        let (exit_tx, mut exited) = watch::channel(None);
        let monitor = tokio::spawn(monitor(
            child,
            stop_rx,
            exit_tx,
            Monitor {
                status: self.status.clone(),
                events: self.events.clone(),
                instance,
                model_id: launch.model_id.clone(),
                grace: self.shutdown_grace,
            },
        ));

        let client = LlamaCppClient::with_url(handle.endpoint.clone());
        let ready = match self.wait_ready(&client, &mut exited).await {
            Ok(()) => {
                self.status.send_modify(|status| {
                    if let Some(current) = status {
                        if current.instance == instance {
                            current.health = HealthState::Ready;
                        }
                    }
                });
                // The process may have died between the health check and the transition.
                let exit = *exited.borrow();
                match exit {
                    Some(code) => Err(StartError::ProcessExited(code)),
                    None => Ok(()),
                }
            }
            Err(e) => Err(e),
        };

        match ready {
            Ok(()) => {
                handle.health = HealthState::Ready;
                Ok(RunningServer {
                    handle,
                    stop,
                    monitor,
                })
            }
            Err(e) => {
                shutdown(stop, monitor).await;
                Err(e)
            }
        }
    }

    /// Poll `/health` until success, process exit, or the startup timeout.
    async fn wait_ready(
        &self,
        client: &LlamaCppClient,
        exited: &mut watch::Receiver<Option<Option<i32>>>,
    ) -> Result<(), StartError> {
        let deadline = Instant::now() + self.startup_timeout;
        info!("Waiting for llama-server to become ready...");

        loop {
            if let Some(code) = *exited.borrow_and_update() {
                return Err(StartError::ProcessExited(code));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StartError::Timeout);
            }
            if let Ok(Ok(())) = timeout(remaining, client.check_health()).await {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = sleep(self.health_interval.min(remaining)) => {}
                _ = exited.changed() => {}
            }
        }
    }

    async fn stop_locked(&self, slot: &mut Option<RunningServer>) {
        let Some(running) = slot.take() else {
            return;
        };
        let RunningServer {
            handle,
            stop,
            monitor,
        } = running;

        info!("Stopping llama-server (PID: {:?})", handle.pid);
        // Marked before signalling so the monitor does not report a crash.
        self.status.send_modify(|status| {
            if let Some(current) = status {
                if current.instance == handle.instance {
                    current.health = HealthState::Stopped;
                }
            }
        });
        shutdown(stop, monitor).await;
        self.events.publish(RuntimeEvent::ModelStopped {
            model_id: handle.model_id,
        });
    }

    fn resolve_port(&self) -> Result<u16, StartError> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .map_err(|e| StartError::Port(e.to_string()))
    }
}

async fn shutdown(stop: oneshot::Sender<()>, monitor: JoinHandle<()>) {
    // Fails only if the monitor already saw the process exit.
    let _ = stop.send(());
    if let Err(e) = monitor.await {
        warn!("llama-server monitor task failed: {}", e);
    }
}

async fn monitor(
    mut child: Child,
    stop: oneshot::Receiver<()>,
    exited: watch::Sender<Option<Option<i32>>>,
    ctx: Monitor,
) {
    tokio::select! {
        result = child.wait() => {
            let code = result.ok().and_then(|status| status.code());
            exited.send_replace(Some(code));

            let crashed = ctx.status.send_if_modified(|status| match status {
                Some(handle) if handle.instance == ctx.instance && handle.is_ready() => {
                    handle.health = HealthState::Error;
                    true
                }
                _ => false,
            });
            if crashed {
                warn!("llama-server exited unexpectedly ({})", describe_exit(&code));
                ctx.events.publish(RuntimeEvent::ModelError {
                    model_id: ctx.model_id,
                    message: format!(
                        "Inference server exited unexpectedly ({})",
                        describe_exit(&code)
                    ),
                });
            } else {
                debug!("llama-server exited ({})", describe_exit(&code));
            }
        }
        // Also taken when the sender is dropped with the supervisor.
        _ = stop => {
            let code = terminate(&mut child, ctx.grace).await;
            debug!("llama-server stopped ({})", describe_exit(&code));
            exited.send_replace(Some(code));
        }
    }
}

/// SIGTERM, bounded wait, then kill.
async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is our own child and has not been reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => return status.code(),
                Ok(Err(e)) => warn!("Error waiting for llama-server: {}", e),
                Err(_) => warn!("Server didn't exit gracefully, killing..."),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!("Kill after shutdown failed: {}", e);
    }
    None
}

fn forward_output<R>(reader: Option<R>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "llama_server", "[{}] {}", stream, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain_events, MockResponse, MockServer, ShellCommand};

    fn launch_in(dir: &Path, model_id: &str) -> ServerLaunch {
        let model = dir.join(format!("{}.gguf", model_id));
        std::fs::write(&model, b"gguf").unwrap();
        ServerLaunch {
            model_id: model_id.to_string(),
            paths: ModelPaths {
                model,
                mmproj: None,
            },
        }
    }

    fn supervisor(script: &str, events: &EventBus) -> ServerSupervisor {
        ServerSupervisor::new(Arc::new(ShellCommand::new(script)), events.clone())
            .with_health_interval(Duration::from_millis(20))
            .with_shutdown_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_llama_server_args() {
        let command = LlamaServerCommand::new("/opt/llama-server")
            .with_ctx_size(4096)
            .with_n_predict(512);
        let launch = ServerLaunch {
            model_id: "m".into(),
            paths: ModelPaths {
                model: PathBuf::from("/models/m/m.gguf"),
                mmproj: Some(PathBuf::from("/models/m/proj.gguf")),
            },
        };
        let args = command.args(&launch, 8080);
        assert_eq!(&args[..4], ["--model", "/models/m/m.gguf", "--mmproj", "/models/m/proj.gguf"]);
        let port = args.iter().position(|a| a == "--port").unwrap();
        assert_eq!(args[port + 1], "8080");
        let ctx = args.iter().position(|a| a == "--ctx-size").unwrap();
        assert_eq!(args[ctx + 1], "4096");
        assert!(args.ends_with(&["--reasoning-format".to_string(), "none".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let command = LlamaServerCommand::new(dir.path().join("no-such-binary"));
        let supervisor = ServerSupervisor::new(Arc::new(command), events);

        let result = supervisor.start(launch_in(dir.path(), "m")).await;
        assert!(matches!(result, Err(StartError::BinaryNotFound(_))));
        assert!(!supervisor.is_ready());

        let names: Vec<_> = drain_events(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, ["model-loading", "model-error"]);
    }

    #[tokio::test]
    async fn test_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let supervisor = supervisor("exec sleep 30", &events);
        let launch = ServerLaunch {
            model_id: "m".into(),
            paths: ModelPaths {
                model: dir.path().join("absent.gguf"),
                mmproj: None,
            },
        };
        assert!(matches!(
            supervisor.start(launch).await,
            Err(StartError::ModelMissing(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_during_startup() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let supervisor = supervisor("exit 3", &events);

        let result = supervisor.start(launch_in(dir.path(), "m")).await;
        assert!(matches!(result, Err(StartError::ProcessExited(Some(3)))));
        assert_eq!(supervisor.status().unwrap().health, HealthState::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let supervisor =
            supervisor("exec sleep 30", &events).with_startup_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = supervisor.start(launch_in(dir.path(), "m")).await;
        assert!(matches!(result, Err(StartError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!supervisor.is_ready());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_ready_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        server.route("GET", "/health", MockResponse::status(200));

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let supervisor = supervisor("exec sleep 30", &events).with_port(server.port());

        let handle = supervisor.start(launch_in(dir.path(), "m")).await.unwrap();
        assert!(handle.is_ready());
        assert!(handle.pid.is_some());
        assert_eq!(handle.endpoint, server.url());
        assert!(supervisor.is_ready());

        assert!(matches!(
            supervisor.start(launch_in(dir.path(), "other")).await,
            Err(StartError::AlreadyRunning)
        ));

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.status().unwrap().health, HealthState::Stopped);

        let names: Vec<_> = drain_events(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names, ["model-loading", "model-ready", "model-stopped"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_publishes_switch_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        server.route("GET", "/health", MockResponse::status(200));

        let events = EventBus::default();
        let supervisor = supervisor("exec sleep 30", &events).with_port(server.port());
        let first = supervisor.start(launch_in(dir.path(), "a")).await.unwrap();

        let mut rx = events.subscribe();
        let second = supervisor
            .restart_with(launch_in(dir.path(), "b"))
            .await
            .unwrap();
        assert!(second.instance > first.instance);
        assert_eq!(supervisor.status().unwrap().model_id, "b");

        let statuses: Vec<_> = drain_events(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::ModelSwitching { model_id, status, .. } => {
                    assert_eq!(model_id, "b");
                    Some(status)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            [SwitchStatus::Stopping, SwitchStatus::Starting, SwitchStatus::Ready]
        );
        supervisor.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_after_ready_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        server.route("GET", "/health", MockResponse::status(200));

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let supervisor = supervisor("sleep 1; exit 7", &events).with_port(server.port());
        let mut health = supervisor.subscribe();

        supervisor.start(launch_in(dir.path(), "m")).await.unwrap();
        let errored = timeout(
            Duration::from_secs(10),
            health.wait_for(|h| h.as_ref().is_some_and(|h| h.health == HealthState::Error)),
        )
        .await
        .map(|seen| seen.is_ok());
        assert!(matches!(errored, Ok(true)));

        let error = crate::testing::wait_for(&mut rx, |e| e.name() == "model-error").await;
        match error.last() {
            Some(RuntimeEvent::ModelError { message, .. }) => assert!(message.contains("7")),
            other => panic!("unexpected: {:?}", other),
        }
        supervisor.stop().await;
    }
}
