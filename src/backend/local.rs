//! Embedded stand-in for the hosted auth provider and data store.
//!
//! One [`LocalServer`] owns the database and the realtime hub. Each
//! [`LocalClient`] is one browser-like connection holding its own current
//! session and auth listeners, so several users can share a server and see
//! each other's deal changes.

use super::password::{hash_password, verify_password};
use super::{AuthProvider, AuthSubscription, ChangeSubscription, DataStore, SignUpOutcome, Subscribers};
use crate::config::AppSettings;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AccountType, AuthChange, AuthChangeEvent, AuthUser, DealChange, DealChangeKind, Metric, SalesDeal, Session,
    UserProfile,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};

const RLS_PROFILE_VIOLATION: &str = "new row violates row-level security policy for table \"user_profiles\"";

pub struct LocalServer {
    db: Database,
    deal_changes: Subscribers<DealChange>,
    session_ttl: Duration,
    profile_trigger: bool,
}

impl LocalServer {
    pub fn new(db: Database, session_ttl_secs: i64, profile_trigger: bool) -> Arc<Self> {
        Arc::new(Self {
            db,
            deal_changes: Subscribers::default(),
            session_ttl: Duration::seconds(session_ttl_secs.max(1)),
            profile_trigger,
        })
    }

    pub fn open(settings: &AppSettings) -> AppResult<Arc<Self>> {
        let db = Database::new(&settings.database_path())?;
        Ok(Self::new(db, settings.session_ttl_secs, settings.profile_trigger))
    }

    pub fn in_memory(profile_trigger: bool) -> AppResult<Arc<Self>> {
        Ok(Self::new(Database::in_memory()?, 3600, profile_trigger))
    }

    pub fn connect(self: &Arc<Self>) -> Arc<LocalClient> {
        Arc::new(LocalClient {
            server: Arc::clone(self),
            current: Mutex::new(None),
            auth_listeners: Subscribers::default(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn realtime_subscribers(&self) -> usize {
        self.deal_changes.active()
    }

    /// Administrative delete, as performed from the backend console.
    pub fn delete_deal(&self, deal_id: i64) -> AppResult<bool> {
        let removed = self.db.delete_deal(deal_id)?;
        if removed {
            self.publish(DealChange {
                kind: DealChangeKind::Delete,
                record: Some(serde_json::json!({ "id": deal_id })),
            });
        }
        Ok(removed)
    }

    pub fn promote_to_admin(&self, user_id: &str) -> AppResult<()> {
        self.db.set_account_type(user_id, AccountType::Admin)
    }

    fn publish(&self, change: DealChange) {
        let delivered = self.deal_changes.publish(&change);
        tracing::debug!(kind = ?change.kind, delivered, "published deal change");
    }

    fn issue_session(&self, user: AuthUser) -> AppResult<Session> {
        let session = Session {
            user,
            access_token: opaque_token(),
            refresh_token: opaque_token(),
            expires_at: Utc::now() + self.session_ttl,
        };
        self.db.insert_session(&session)?;
        Ok(session)
    }

    fn account_type(&self, user_id: &str) -> AppResult<Option<AccountType>> {
        Ok(self.db.get_profile(user_id)?.map(|profile| profile.account_type))
    }

    /// The caller's session, if the server still honors it.
    fn require_session(&self, session: Option<Session>) -> AppResult<Session> {
        let session = session.ok_or(AppError::NotAuthenticated)?;
        if !self.db.session_is_active(&session.access_token, Utc::now())? {
            return Err(AppError::NotAuthenticated);
        }
        Ok(session)
    }

    fn can_manage_profile(&self, session: &Session, user_id: &str) -> AppResult<bool> {
        if session.user_id() == user_id {
            return Ok(true);
        }
        Ok(self.account_type(session.user_id())? == Some(AccountType::Admin))
    }
}

pub struct LocalClient {
    server: Arc<LocalServer>,
    current: Mutex<Option<Session>>,
    auth_listeners: Subscribers<AuthChange>,
}

impl LocalClient {
    pub fn server(&self) -> &Arc<LocalServer> {
        &self.server
    }

    fn current(&self) -> Option<Session> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, session: Option<Session>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let delivered = self.auth_listeners.publish(&AuthChange { event, session });
        tracing::debug!(event = event.as_str(), delivered, "emitted auth change");
    }

    /// Runs database and hashing work on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, work: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalServer) -> AppResult<T> + Send + 'static,
    {
        let server = Arc::clone(&self.server);
        tokio::task::spawn_blocking(move || work(server.as_ref()))
            .await
            .map_err(|error| AppError::Internal(format!("{} task failed: {}", operation, error)))?
    }
}

#[async_trait]
impl AuthProvider for LocalClient {
    async fn get_session(&self) -> AppResult<Option<Session>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if session.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn get_user(&self) -> AppResult<Option<AuthUser>> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        let user_id = session.user_id().to_string();
        self.blocking("get_user", move |server| server.db.get_auth_user(&user_id))
            .await
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Session> {
        let email = email.trim().to_ascii_lowercase();
        let password = password.to_string();
        let session = self
            .blocking("sign_in", move |server| {
                let Some((user, hash)) = server.db.find_auth_user_by_email(&email)? else {
                    return Err(AppError::InvalidCredentials);
                };
                if !verify_password(&password, &hash)? {
                    return Err(AppError::InvalidCredentials);
                }
                server.issue_session(user)
            })
            .await?;

        self.set_current(Some(session.clone()));
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: serde_json::Value) -> AppResult<SignUpOutcome> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::Backend("Unable to validate email address: invalid format".to_string()));
        }
        let password = password.to_string();
        let (user, session) = self
            .blocking("sign_up", move |server| {
                let hash = hash_password(&password)?;
                let user = server.db.create_auth_user(&email, &hash, &metadata)?;

                if server.profile_trigger {
                    let name = user
                        .metadata_name()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
                    server.db.insert_profile(&user.id, &name, AccountType::Member)?;
                }

                let session = server.issue_session(user.clone())?;
                Ok((user, session))
            })
            .await?;

        self.set_current(Some(session.clone()));
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome {
            user,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> AppResult<()> {
        if let Some(session) = self.current() {
            self.blocking("sign_out", move |server| server.db.delete_session(&session.access_token))
                .await?;
        }
        self.set_current(None);
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    async fn refresh_session(&self) -> AppResult<Session> {
        let current = self.current().ok_or(AppError::NotAuthenticated)?;
        let session = self
            .blocking("refresh_session", move |server| {
                let Some(user_id) = server.db.take_refresh_token(&current.refresh_token)? else {
                    return Err(AppError::NotAuthenticated);
                };
                let user = server
                    .db
                    .get_auth_user(&user_id)?
                    .ok_or(AppError::NotAuthenticated)?;
                server.issue_session(user)
            })
            .await?;

        self.set_current(Some(session.clone()));
        self.emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    fn on_auth_change(&self) -> AuthSubscription {
        let initial = AuthChange {
            event: AuthChangeEvent::InitialSession,
            session: self.current().filter(|session| !session.is_expired(Utc::now())),
        };
        AuthSubscription::new(self.auth_listeners.subscribe_with(initial))
    }
}

#[async_trait]
impl DataStore for LocalClient {
    async fn list_deals(&self) -> AppResult<Vec<SalesDeal>> {
        let session = self.current();
        self.blocking("list_deals", move |server| {
            server.require_session(session)?;
            server.db.list_deals()
        })
        .await
    }

    async fn deal_totals(&self) -> AppResult<Vec<Metric>> {
        let session = self.current();
        self.blocking("deal_totals", move |server| {
            server.require_session(session)?;
            server.db.deal_totals()
        })
        .await
    }

    async fn insert_deal(&self, name: &str, value: f64) -> AppResult<SalesDeal> {
        let session = self.current();
        let name = name.to_string();
        let deal = self
            .blocking("insert_deal", move |server| {
                let session = server.require_session(session)?;
                server.db.insert_deal(&name, value, session.user_id())
            })
            .await?;
        self.server.publish(DealChange {
            kind: DealChangeKind::Insert,
            record: Some(serde_json::to_value(&deal)?),
        });
        Ok(deal)
    }

    async fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let session = self.current();
        let user_id = user_id.to_string();
        self.blocking("get_profile", move |server| {
            let session = server.require_session(session)?;
            if !server.can_manage_profile(&session, &user_id)? {
                return Ok(None);
            }
            server.db.get_profile(&user_id)
        })
        .await
    }

    async fn insert_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        let session = self.current();
        let (user_id, name) = (user_id.to_string(), name.to_string());
        self.blocking("insert_profile", move |server| {
            let session = server.require_session(session)?;
            if session.user_id() != user_id {
                return Err(AppError::Backend(RLS_PROFILE_VIOLATION.to_string()));
            }
            server.db.insert_profile(&user_id, &name, AccountType::Member)
        })
        .await
    }

    async fn update_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        let session = self.current();
        let (user_id, name) = (user_id.to_string(), name.to_string());
        self.blocking("update_profile", move |server| {
            let session = server.require_session(session)?;
            if !server.can_manage_profile(&session, &user_id)? {
                return Err(AppError::Backend(RLS_PROFILE_VIOLATION.to_string()));
            }
            server.db.update_profile_name(&user_id, &name)
        })
        .await
    }

    fn channel(&self, name: &str) -> ChangeSubscription {
        tracing::debug!(channel = name, "realtime channel subscribed");
        ChangeSubscription::new(name, self.server.deal_changes.subscribe())
    }
}

fn opaque_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
