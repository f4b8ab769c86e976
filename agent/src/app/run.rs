//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::SyncError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::sync::state::SyncStateStore;
use crate::workers::scheduler::{self, CheckRequest};

/// Pending check-now requests the scheduler accepts before callers wait
const CHECK_QUEUE_DEPTH: usize = 16;

/// Run the sync daemon until shutdown or until the scheduler halts
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), SyncError> {
    info!("Initializing pisync...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let (halt_tx, halt_rx) = oneshot::channel();
    if let Err(e) = init(&options, shutdown_tx.clone(), halt_tx, &mut shutdown_manager).await {
        error!("Failed to start pisync: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    let outcome = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            Ok(())
        }
        Ok(err) = halt_rx => {
            error!("Scheduler halted ({}), shutting down: {}", err.kind(), err);
            Err(err)
        }
    };

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    outcome
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    halt_tx: oneshot::Sender<SyncError>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), SyncError> {
    let app_state = Arc::new(AppState::init(options).await?);
    let (check_tx, check_rx) = mpsc::channel(CHECK_QUEUE_DEPTH);

    if options.enable_control_server {
        init_control_server(
            options,
            app_state.clone(),
            check_tx,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    } else {
        // no other producer: check-now is only reachable through the server
        drop(check_tx);
    }

    init_scheduler_worker(
        options,
        app_state,
        check_rx,
        halt_tx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await
}

async fn init_scheduler_worker(
    options: &AppOptions,
    app_state: Arc<AppState>,
    check_rx: mpsc::Receiver<CheckRequest>,
    halt_tx: oneshot::Sender<SyncError>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SyncError> {
    info!("Initializing scheduler worker...");

    let state = app_state.state_store.load().await?;
    info!(
        "Device {} tracks {} file(s), checking every {}s",
        app_state.identity,
        state.len(),
        options.scheduler.interval.as_secs()
    );

    let mut syncer = app_state.syncer(options);
    let mut fsm = app_state.fsm(options);
    let worker_options = options.scheduler.clone();
    let status = app_state.status.clone();

    let handle = tokio::spawn(async move {
        let result = scheduler::run(
            &worker_options,
            &mut syncer,
            &mut fsm,
            state,
            status,
            check_rx,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;

        match result {
            Ok(state) => info!("Scheduler stopped, {} file(s) tracked", state.len()),
            Err(e) => {
                let _ = halt_tx.send(e);
            }
        }
        // holds the instance lock until the worker is done
        drop(app_state);
    });

    shutdown_manager.with_scheduler_worker_handle(handle)?;
    Ok(())
}

async fn init_control_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    check_tx: mpsc::Sender<CheckRequest>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SyncError> {
    info!("Initializing control server...");

    let server_state = ServerState::new(
        app_state.identity.as_str(),
        app_state.status.clone(),
        check_tx,
        options.check_timeout(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_control_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    control_server_handle: Option<JoinHandle<Result<(), SyncError>>>,
    scheduler_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            control_server_handle: None,
            scheduler_worker_handle: None,
        }
    }

    pub fn with_scheduler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), SyncError> {
        if self.scheduler_worker_handle.is_some() {
            return Err(SyncError::ShutdownError(
                "scheduler_handle already set".to_string(),
            ));
        }
        self.scheduler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_control_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), SyncError>>,
    ) -> Result<(), SyncError> {
        if self.control_server_handle.is_some() {
            return Err(SyncError::ShutdownError("server_handle already set".to_string()));
        }
        self.control_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), SyncError> {
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
                std::process::exit(crate::errors::exit_code::FAILURE);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), SyncError> {
        info!("Shutting down pisync...");

        // 1. Control server, so no new check requests arrive
        if let Some(handle) = self.control_server_handle.take() {
            handle
                .await
                .map_err(|e| SyncError::ShutdownError(e.to_string()))??;
        }

        // 2. Scheduler worker
        if let Some(handle) = self.scheduler_worker_handle.take() {
            handle
                .await
                .map_err(|e| SyncError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
