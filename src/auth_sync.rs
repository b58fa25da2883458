//! Keeps the [`SessionStore`] consistent with the auth provider.
//!
//! Two asynchronous sources feed the store: the explicit `get_session` call
//! issued at mount, and the provider's push notifications. Both are turned
//! into messages for a single receive loop which owns every state
//! transition. Profile fetches run as spawned tasks whose results come back
//! through the same loop.

use crate::backend::{AuthProvider, AuthSubscription};
use crate::data_access::{with_timeout, DataAccess};
use crate::errors::{AppError, AppResult};
use crate::models::{AuthChange, AuthChangeEvent, AuthUser, Session, SignUpPayload, UserProfile};
use crate::session::{InitPhase, SessionState, SessionStore};
use crate::validation::{normalize_display_name, FieldError, ValidationErrors};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

type RefreshReply = oneshot::Sender<AppResult<Option<UserProfile>>>;

enum Command {
    RefreshProfile { reply: RefreshReply },
    Shutdown,
}

enum LoopMessage {
    InitialSession(AppResult<Option<Session>>),
    ProfileLoaded {
        generation: u64,
        user_id: String,
        result: AppResult<Option<UserProfile>>,
    },
}

#[derive(Clone)]
pub struct AuthSynchronizer {
    auth: Arc<dyn AuthProvider>,
    data: DataAccess,
    store: SessionStore,
    commands: mpsc::UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    request_timeout: Duration,
}

impl AuthSynchronizer {
    /// Mounts the synchronizer: registers for notifications, issues the
    /// explicit session fetch and starts the receive loop.
    pub fn start(auth: Arc<dyn AuthProvider>, data: DataAccess) -> Self {
        let request_timeout = data.request_timeout();
        let store = SessionStore::new();
        let alive = Arc::new(AtomicBool::new(true));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let notifications = auth.on_auth_change();

        {
            let auth = Arc::clone(&auth);
            let message_tx = message_tx.clone();
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let result = with_timeout("get_session", request_timeout, auth.get_session()).await;
                if alive.load(Ordering::SeqCst) {
                    let _ = message_tx.send(LoopMessage::InitialSession(result));
                }
            });
        }

        let sync_loop = SyncLoop {
            data: data.clone(),
            store: store.clone(),
            alive: Arc::clone(&alive),
            messages: message_tx,
            last_fetched_user: None,
            generation: 0,
            pending_refreshes: Vec::new(),
        };
        let handle = tokio::spawn(sync_loop.run(notifications, command_rx, message_rx));

        Self {
            auth,
            data,
            store,
            commands: command_tx,
            alive,
            task: Arc::new(Mutex::new(Some(handle))),
            request_timeout,
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn wait_until_loaded(&self) -> SessionState {
        self.store.wait_until_loaded().await
    }

    /// Store updates arrive through the `SIGNED_IN` notification.
    pub async fn sign_in(&self, email: &str, password: &str) -> AppResult<Session> {
        let session = with_timeout(
            "sign_in",
            self.request_timeout,
            self.auth.sign_in_with_password(email, password),
        )
        .await?;
        tracing::info!(user_id = %session.user.id, "signed in");
        Ok(session)
    }

    /// Signs up, then creates the profile row as a fallback for when the
    /// server-side trigger has not produced it. A duplicate row means the
    /// trigger won and is resolved with an update; any other fallback
    /// failure is logged and not surfaced, since the account exists.
    pub async fn sign_up(&self, payload: &SignUpPayload) -> AppResult<AuthUser> {
        let Some(name) = normalize_display_name(&payload.name) else {
            return Err(AppError::Validation(ValidationErrors {
                fields: vec![FieldError {
                    field: "name".to_string(),
                    message: "Name is required".to_string(),
                }],
            }));
        };

        let outcome = with_timeout(
            "sign_up",
            self.request_timeout,
            self.auth.sign_up(
                payload.email.trim(),
                &payload.password,
                serde_json::json!({ "name": name }),
            ),
        )
        .await?;
        let user = outcome.user;
        tracing::info!(user_id = %user.id, confirmed = outcome.session.is_some(), "signed up");

        match self.data.ensure_profile(&user.id, &name).await {
            Ok(profile) => {
                tracing::debug!(user_id = %profile.id, "profile ensured after sign-up");
            }
            Err(error) => {
                tracing::warn!(user_id = %user.id, error = %error, "profile fallback after sign-up failed");
            }
        }

        Ok(user)
    }

    pub async fn sign_out(&self) -> AppResult<()> {
        with_timeout("sign_out", self.request_timeout, self.auth.sign_out()).await?;
        tracing::info!("signed out");
        Ok(())
    }

    pub async fn refresh_session(&self) -> AppResult<Session> {
        with_timeout("refresh_session", self.request_timeout, self.auth.refresh_session()).await
    }

    /// Forces a new profile fetch for the signed-in user and resolves once
    /// the freshest fetch has been merged into the store.
    pub async fn refresh_user_profile(&self) -> AppResult<Option<UserProfile>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RefreshProfile { reply })
            .map_err(|_| AppError::Internal("session synchronizer stopped".to_string()))?;
        response
            .await
            .map_err(|_| AppError::Internal("session synchronizer stopped".to_string()))?
    }

    pub async fn update_display_name(&self, name: &str) -> AppResult<Option<UserProfile>> {
        let user_id = self
            .store
            .snapshot()
            .user_id()
            .map(ToString::to_string)
            .ok_or(AppError::NotAuthenticated)?;
        let Some(name) = normalize_display_name(name) else {
            return Err(AppError::Validation(ValidationErrors {
                fields: vec![FieldError {
                    field: "name".to_string(),
                    message: "Name is required".to_string(),
                }],
            }));
        };

        self.data.update_profile(&user_id, &name).await?;
        self.refresh_user_profile().await
    }

    /// Unmount. No continuation writes to the store afterwards.
    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "session synchronizer loop ended abnormally");
            }
        }
        tracing::debug!("session synchronizer stopped");
    }
}

struct SyncLoop {
    data: DataAccess,
    store: SessionStore,
    alive: Arc<AtomicBool>,
    messages: mpsc::UnboundedSender<LoopMessage>,
    last_fetched_user: Option<String>,
    generation: u64,
    /// Refresh callers waiting on a fetch: issued generation and user id.
    pending_refreshes: Vec<(u64, String, RefreshReply)>,
}

impl SyncLoop {
    async fn run(
        mut self,
        mut notifications: AuthSubscription,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: mpsc::UnboundedReceiver<LoopMessage>,
    ) {
        let mut notifications_open = true;
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::RefreshProfile { reply }) => self.refresh_profile(reply),
                    Some(Command::Shutdown) | None => break,
                },
                message = messages.recv() => match message {
                    Some(LoopMessage::InitialSession(result)) => self.apply_explicit_session(result),
                    Some(LoopMessage::ProfileLoaded { generation, user_id, result }) => {
                        self.apply_profile(generation, &user_id, result)
                    }
                    None => break,
                },
                change = notifications.recv(), if notifications_open => match change {
                    Some(change) => self.apply_notification(change),
                    None => {
                        tracing::debug!("auth notification stream closed");
                        notifications_open = false;
                    }
                },
            }
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
        }
        self.answer_pending(|| Err(AppError::Internal("session synchronizer stopped".to_string())));
    }

    fn write(&self, apply: impl FnOnce(&mut SessionState)) {
        if self.alive.load(Ordering::SeqCst) {
            self.store.update(apply);
        }
    }

    fn apply_explicit_session(&mut self, result: AppResult<Option<Session>>) {
        let phase = self.store.snapshot().phase;
        let session = match result {
            Ok(session) => session,
            Err(error) => {
                // Not authoritative: whatever the notification delivered stands.
                tracing::warn!(error = %error, "initial session fetch failed");
                let next = match phase {
                    InitPhase::AwaitingBothSources => InitPhase::ExplicitFailed,
                    InitPhase::NotificationWon => InitPhase::Ready,
                    other => other,
                };
                self.write(move |state| {
                    state.phase = next;
                    state.is_loading = false;
                });
                return;
            }
        };

        match phase {
            InitPhase::AwaitingBothSources => {
                self.write(|state| state.phase = InitPhase::ExplicitWon);
                self.apply_session(session);
            }
            InitPhase::NotificationWon => {
                self.write(|state| state.phase = InitPhase::Ready);
                // Same information the notification carried; the fetch
                // marker keeps this from issuing a second profile load.
                self.apply_session(session);
            }
            InitPhase::ExplicitWon | InitPhase::ExplicitFailed | InitPhase::Ready => {
                tracing::debug!("explicit session result arrived after reconciliation");
            }
        }
        self.write(|state| state.is_loading = false);
    }

    fn apply_notification(&mut self, change: AuthChange) {
        tracing::debug!(event = change.event.as_str(), "auth notification");
        match change.event {
            AuthChangeEvent::InitialSession => {
                let phase = self.store.snapshot().phase;
                match phase {
                    InitPhase::AwaitingBothSources => {
                        self.write(|state| state.phase = InitPhase::NotificationWon);
                        self.apply_session(change.session);
                        self.write(|state| state.is_loading = false);
                    }
                    InitPhase::ExplicitFailed => {
                        self.write(|state| state.phase = InitPhase::Ready);
                        self.apply_session(change.session);
                    }
                    InitPhase::ExplicitWon => {
                        tracing::debug!("suppressed duplicate initial session notification");
                        self.write(|state| state.phase = InitPhase::Ready);
                    }
                    InitPhase::NotificationWon | InitPhase::Ready => {
                        tracing::debug!("ignored repeated initial session notification");
                    }
                }
            }
            AuthChangeEvent::SignedIn => match change.session {
                Some(session) => self.apply_session(Some(session)),
                None => tracing::warn!("signed-in notification without a session"),
            },
            AuthChangeEvent::SignedOut => self.sign_out(),
            AuthChangeEvent::TokenRefreshed | AuthChangeEvent::UserUpdated => {
                let Some(session) = change.session else {
                    return;
                };
                if self.store.snapshot().user_id() != Some(session.user_id()) {
                    tracing::debug!(event = change.event.as_str(), "session update for a user not signed in here");
                    return;
                }
                let update_user = change.event == AuthChangeEvent::UserUpdated;
                self.write(move |state| {
                    if update_user {
                        state.user = Some(session.user.clone());
                    }
                    state.session = Some(session);
                });
            }
        }
    }

    /// Sign-in semantics: identity is written immediately, the profile is
    /// fetched only when this user has not already triggered a fetch.
    fn apply_session(&mut self, session: Option<Session>) {
        let Some(session) = session else {
            if self.store.snapshot().user.is_some() {
                self.sign_out();
            }
            return;
        };

        let user_id = session.user_id().to_string();
        let switched = self.store.snapshot().user_id() != Some(user_id.as_str());
        if self.alive.load(Ordering::SeqCst) {
            self.store.set_identity(session);
            if switched {
                self.store.update(|state| state.profile = None);
            }
        }
        if switched {
            self.answer_pending_except(&user_id);
        }
        if self.last_fetched_user.as_deref() != Some(user_id.as_str()) {
            self.fetch_profile(user_id);
        }
    }

    fn sign_out(&mut self) {
        self.last_fetched_user = None;
        // Results of fetches issued before this point are discarded.
        self.generation += 1;
        if self.alive.load(Ordering::SeqCst) {
            self.store.clear();
        }
        self.answer_pending(|| Ok(None));
    }

    fn refresh_profile(&mut self, reply: RefreshReply) {
        let Some(user_id) = self.store.snapshot().user_id().map(ToString::to_string) else {
            let _ = reply.send(Err(AppError::NotAuthenticated));
            return;
        };
        self.last_fetched_user = None;
        self.fetch_profile(user_id.clone());
        self.pending_refreshes.push((self.generation, user_id, reply));
    }

    fn fetch_profile(&mut self, user_id: String) {
        self.generation += 1;
        let generation = self.generation;
        self.last_fetched_user = Some(user_id.clone());
        let in_flight = user_id.clone();
        self.write(move |state| state.profile_fetch_in_flight = Some(in_flight));

        tracing::debug!(user_id = %user_id, generation, "fetching profile");
        let data = self.data.clone();
        let messages = self.messages.clone();
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            let result = data.get_profile(&user_id).await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let _ = messages.send(LoopMessage::ProfileLoaded {
                generation,
                user_id,
                result,
            });
        });
    }

    fn apply_profile(&mut self, generation: u64, user_id: &str, result: AppResult<Option<UserProfile>>) {
        if generation != self.generation {
            tracing::debug!(user_id, generation, current = self.generation, "discarded stale profile result");
            return;
        }
        if self.store.snapshot().user_id() != Some(user_id) {
            tracing::debug!(user_id, "discarded profile result for a different user");
            return;
        }

        let profile = match result {
            Ok(profile) => {
                if profile.is_none() {
                    tracing::debug!(user_id, "no profile row yet");
                }
                let merged = profile.clone();
                self.write(move |state| {
                    state.profile = merged;
                    state.profile_fetch_in_flight = None;
                });
                profile
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "profile fetch failed; continuing without profile");
                self.write(|state| state.profile_fetch_in_flight = None);
                self.store.snapshot().profile
            }
        };

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_refreshes)
            .into_iter()
            .partition(|(issued, owner, _)| *issued <= generation && owner == user_id);
        self.pending_refreshes = waiting;
        for (_, _, reply) in ready {
            let _ = reply.send(Ok(profile.clone()));
        }
    }

    fn answer_pending(&mut self, answer: impl Fn() -> AppResult<Option<UserProfile>>) {
        for (_, _, reply) in self.pending_refreshes.drain(..) {
            let _ = reply.send(answer());
        }
    }

    /// Callers refreshing a user who is no longer signed in get no profile.
    fn answer_pending_except(&mut self, user_id: &str) {
        let (stale, current): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_refreshes)
            .into_iter()
            .partition(|(_, owner, _)| owner != user_id);
        self.pending_refreshes = current;
        for (_, owner, reply) in stale {
            tracing::debug!(user_id = %owner, "profile refresh superseded by a different sign-in");
            let _ = reply.send(Ok(None));
        }
    }
}
