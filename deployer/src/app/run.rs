//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::PlatformError;
use crate::saga::coordinator;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::backend_deploy::BackendDeployWorker;
use crate::workers::build::{BuildWorker, BuildWorkerDeps};
use crate::workers::clone::CloneWorker;
use crate::workers::compensation::CompensationWorker;
use crate::workers::stage::{self, StageDeps, StageWorker};

/// Run the deployment daemon
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PlatformError> {
    info!("Initializing verend {}...", version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start verend: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn shutdown_future(mut shutdown_rx: broadcast::Receiver<()>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = shutdown_rx.recv().await;
    })
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PlatformError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_coordinator(app_state.clone(), shutdown_manager, &shutdown_tx)?;
    init_stage_workers(options, app_state.clone(), shutdown_manager, &shutdown_tx)?;

    if options.enable_server {
        init_socket_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }
    Ok(())
}

fn init_coordinator(
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), PlatformError> {
    info!("Initializing coordinator...");

    let shutdown_rx = shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        coordinator::run(
            app_state.coordinator.clone(),
            app_state.event_bus(),
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });

    shutdown_manager.with_coordinator_handle(handle)
}

fn init_stage_workers(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<(), PlatformError> {
    let workspaces = options.layout.workspaces_dir();

    let clone: Arc<dyn StageWorker> = Arc::new(CloneWorker::new(app_state.source.clone(), workspaces.clone()));
    let build: Arc<dyn StageWorker> = Arc::new(BuildWorker::new(
        BuildWorkerDeps {
            source: app_state.source.clone(),
            artifacts: app_state.artifacts.clone(),
            registry: app_state.registry.clone(),
            runtime: app_state.runtime.clone(),
            publisher: app_state.publisher(),
        },
        workspaces,
        options.registry.repository.clone(),
    ));
    let backend_deploy: Arc<dyn StageWorker> = Arc::new(BackendDeployWorker::new(app_state.runtime.clone()));
    let compensation: Arc<dyn StageWorker> = Arc::new(CompensationWorker::new(
        app_state.registry.clone(),
        app_state.artifacts.clone(),
        app_state.runtime.clone(),
    ));

    let pools = [
        (clone, options.workers.clone_workers),
        (build, options.workers.build_workers),
        (backend_deploy, options.workers.deploy_workers),
        (compensation, options.workers.compensation_workers),
    ];

    for (worker, size) in pools {
        info!("Initializing {} {} workers...", size.max(1), worker.name());
        for member in 0..size.max(1) {
            let deps = StageDeps {
                queue: app_state.job_queue(),
                publisher: app_state.publisher(),
                stage_timeout: options.workers.stage_timeout,
            };
            let worker = worker.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                stage::run(worker, deps, member, tokio::time::sleep, shutdown_future(shutdown_rx)).await;
            });
            shutdown_manager.with_worker_handle(handle);
        }
    }
    Ok(())
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PlatformError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(app_state.coordinator.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), PlatformError>>>,
    coordinator_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
            coordinator_handle: None,
            worker_handles: Vec::new(),
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PlatformError> {
        if self.app_state.is_some() {
            return Err(PlatformError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_coordinator_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PlatformError> {
        if self.coordinator_handle.is_some() {
            return Err(PlatformError::ShutdownError("coordinator_handle already set".to_string()));
        }
        self.coordinator_handle = Some(handle);
        Ok(())
    }

    pub fn with_worker_handle(&mut self, handle: JoinHandle<()>) {
        self.worker_handles.push(handle);
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PlatformError>>,
    ) -> Result<(), PlatformError> {
        if self.socket_server_handle.is_some() {
            return Err(PlatformError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PlatformError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PlatformError> {
        info!("Shutting down verend...");

        // 1. Socket server, so no new deployments arrive
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))??;
        }

        // 2. Stage workers
        for handle in self.worker_handles.drain(..) {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))?;
        }

        // 3. Coordinator
        if let Some(handle) = self.coordinator_handle.take() {
            handle.await.map_err(|e| PlatformError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
