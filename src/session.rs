use crate::models::{AccountType, AuthUser, Session, UserProfile};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Reconciliation between the explicit session fetch and the first auth
/// notification. Whichever source reports first wins; the other is then
/// only reconciled, never re-applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitPhase {
    AwaitingBothSources,
    ExplicitWon,
    /// The explicit fetch failed; the notification is still applied.
    ExplicitFailed,
    NotificationWon,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub user: Option<AuthUser>,
    pub session: Option<Session>,
    pub profile: Option<UserProfile>,
    pub is_loading: bool,
    pub phase: InitPhase,
    /// User id whose profile fetch has been issued and not yet merged.
    pub profile_fetch_in_flight: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            session: None,
            profile: None,
            is_loading: true,
            phase: InitPhase::AwaitingBothSources,
            profile_fetch_in_flight: None,
        }
    }
}

impl SessionState {
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.profile
            .as_ref()
            .map(|profile| profile.account_type == AccountType::Admin)
            .unwrap_or(false)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.profile
            .as_ref()
            .map(|profile| profile.name.as_str())
            .or_else(|| self.user.as_ref().and_then(AuthUser::metadata_name))
    }

    fn clear_identity(&mut self) {
        self.user = None;
        self.session = None;
        self.profile = None;
        self.profile_fetch_in_flight = None;
    }
}

/// Observable holder of the current user, session and profile. Readers
/// subscribe; only the synchronizer writes.
#[derive(Clone)]
pub struct SessionStore {
    sender: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SessionState::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.sender.subscribe()
    }

    /// Waits until the initial session has been resolved by either source.
    pub async fn wait_until_loaded(&self) -> SessionState {
        let mut receiver = self.subscribe();
        let loaded = match receiver.wait_for(|state| !state.is_loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        loaded
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        self.sender.send_modify(apply);
    }

    pub(crate) fn set_identity(&self, session: Session) {
        self.update(|state| {
            state.user = Some(session.user.clone());
            state.session = Some(session);
        });
    }

    pub(crate) fn clear(&self) {
        self.update(SessionState::clear_identity);
    }
}
