pub mod auth_sync;
pub mod backend;
pub mod config;
pub mod data_access;
pub mod db;
pub mod errors;
pub mod models;
pub mod refresh;
pub mod session;
pub mod validation;

use crate::auth_sync::AuthSynchronizer;
use crate::backend::local::{LocalClient, LocalServer};
use crate::config::{AppSettings, DISPLAY_NAME_ENV, EMAIL_ENV, PASSWORD_ENV};
use crate::data_access::DataAccess;
use crate::errors::{AppError, AppResult};
use crate::models::SignUpPayload;
use crate::refresh::DealsController;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Wires the embedded backend, the auth synchronizer and, once mounted,
/// the deals dashboard. Replaces a process-wide auth singleton: every
/// consumer receives its handles from here.
pub struct DashboardApp {
    settings: AppSettings,
    server: Arc<LocalServer>,
    client: Arc<LocalClient>,
    data: DataAccess,
    auth: AuthSynchronizer,
    dashboard: Mutex<Option<DealsController>>,
}

impl DashboardApp {
    pub fn start(settings: AppSettings) -> AppResult<Self> {
        let server = LocalServer::open(&settings)?;
        Ok(Self::with_server(settings, server))
    }

    pub fn with_server(settings: AppSettings, server: Arc<LocalServer>) -> Self {
        let client = server.connect();
        let data = DataAccess::new(client.clone(), settings.request_timeout());
        let auth = AuthSynchronizer::start(client.clone(), data.clone());
        tracing::info!(
            channel = %settings.realtime_channel,
            policy = ?settings.refresh_policy,
            "dashboard app started"
        );
        Self {
            settings,
            server,
            client,
            data,
            auth,
            dashboard: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn server(&self) -> &Arc<LocalServer> {
        &self.server
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn auth(&self) -> &AuthSynchronizer {
        &self.auth
    }

    /// Mounts the deals view. A previous mount is torn down first so only
    /// one realtime subscription exists per app.
    pub fn mount_dashboard(&self) -> DealsController {
        let controller = DealsController::start(
            self.data.clone(),
            &self.settings.realtime_channel,
            self.settings.refresh_policy,
        );
        let previous = self
            .dashboard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(controller.clone());
        if let Some(previous) = previous {
            previous.shutdown();
        }
        controller
    }

    pub fn unmount_dashboard(&self) {
        let mounted = self.dashboard.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(controller) = mounted {
            controller.shutdown();
        }
    }

    /// Stops the dashboard before the synchronizer so no refresh observes
    /// a half-torn-down session.
    pub async fn shutdown(&self) {
        self.unmount_dashboard();
        self.auth.shutdown().await;
        tracing::info!("dashboard app stopped");
    }
}

pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

pub fn init_stdout_tracing() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Headless dashboard: signs in from the environment when credentials are
/// present, logs every session and dashboard transition, and exits on
/// Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let settings = AppSettings::load()?;
    std::fs::create_dir_all(&settings.data_dir)?;
    if settings.log_to_file {
        init_tracing(&settings.log_dir())?;
    } else {
        init_stdout_tracing()?;
    }

    let app = DashboardApp::start(settings)?;
    let initial = app.auth().wait_until_loaded().await;
    tracing::info!(authenticated = initial.is_authenticated(), "initial session resolved");

    if !initial.is_authenticated() {
        sign_in_from_env(app.auth()).await;
    }

    let controller = app.mount_dashboard();
    let watchers = [
        tokio::spawn(log_session_changes(app.auth().subscribe())),
        tokio::spawn(log_dashboard_changes(controller.subscribe())),
    ];

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    for watcher in watchers {
        watcher.abort();
    }
    app.shutdown().await;
    Ok(())
}

async fn sign_in_from_env(auth: &AuthSynchronizer) {
    let (Ok(email), Ok(password)) = (std::env::var(EMAIL_ENV), std::env::var(PASSWORD_ENV)) else {
        tracing::info!("no credentials in environment; staying signed out");
        return;
    };
    match auth.sign_in(&email, &password).await {
        Ok(session) => tracing::info!(user_id = %session.user_id(), "signed in"),
        Err(AppError::InvalidCredentials) => {
            let name = std::env::var(DISPLAY_NAME_ENV).unwrap_or_else(|_| email.clone());
            let payload = SignUpPayload { email, password, name };
            match auth.sign_up(&payload).await {
                Ok(user) => tracing::info!(user_id = %user.id, "registered new account"),
                Err(error) => tracing::warn!(error = %error, "sign-up failed"),
            }
        }
        Err(error) => tracing::warn!(error = %error, "sign-in failed"),
    }
}

async fn log_session_changes(mut receiver: tokio::sync::watch::Receiver<session::SessionState>) {
    while receiver.changed().await.is_ok() {
        let state = receiver.borrow_and_update().clone();
        tracing::info!(
            user_id = state.user_id().unwrap_or("-"),
            display_name = state.display_name().unwrap_or("-"),
            admin = state.is_admin(),
            loading = state.is_loading,
            "session state changed"
        );
    }
}

async fn log_dashboard_changes(mut receiver: tokio::sync::watch::Receiver<refresh::DashboardState>) {
    while receiver.changed().await.is_ok() {
        let state = receiver.borrow_and_update().clone();
        tracing::info!(
            deals = state.deals.len(),
            metrics = state.metrics.len(),
            loading = state.loading,
            syncing = state.is_syncing,
            error = state.error.as_deref().unwrap_or(""),
            "dashboard state changed"
        );
    }
}
