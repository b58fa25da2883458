#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use deal_dashboard_lib::backend::{
    AuthProvider, AuthSubscription, ChangeSubscription, DataStore, SignUpOutcome, Subscribers,
};
use deal_dashboard_lib::errors::{AppError, AppResult};
use deal_dashboard_lib::models::{
    AccountType, AuthChange, AuthChangeEvent, AuthUser, DealChange, DealChangeKind, Metric, SalesDeal,
    Session, UserProfile,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn session_for(user_id: &str, token: &str) -> Session {
    Session {
        user: AuthUser {
            id: user_id.to_string(),
            email: format!("{}@x.com", user_id),
            metadata: serde_json::json!({ "name": user_id }),
        },
        access_token: token.to_string(),
        refresh_token: format!("{}-refresh", token),
        expires_at: Utc::now() + ChronoDuration::hours(1),
    }
}

pub fn profile_for(user_id: &str, name: &str) -> UserProfile {
    UserProfile {
        id: user_id.to_string(),
        name: name.to_string(),
        account_type: AccountType::Member,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn deal(id: i64, name: &str, value: f64) -> SalesDeal {
    SalesDeal {
        id,
        name: name.to_string(),
        value,
        user_id: Some("u-1".to_string()),
        created_by: Some("Ada".to_string()),
    }
}

/// Scripted auth provider. `get_session` can be held until released, and
/// the initial notification can be withheld so a test decides which init
/// source reports first.
pub struct FakeAuth {
    current: Mutex<Option<Session>>,
    listeners: Subscribers<AuthChange>,
    send_initial: bool,
    session_gate: Option<Notify>,
    pub get_session_calls: AtomicUsize,
    pub sign_up_calls: AtomicUsize,
}

impl FakeAuth {
    pub fn new(session: Option<Session>) -> Arc<Self> {
        Self::scripted(session, true, false)
    }

    pub fn scripted(session: Option<Session>, send_initial: bool, gated: bool) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(session),
            listeners: Subscribers::default(),
            send_initial,
            session_gate: gated.then(Notify::new),
            get_session_calls: AtomicUsize::new(0),
            sign_up_calls: AtomicUsize::new(0),
        })
    }

    pub fn release_session(&self) {
        if let Some(gate) = &self.session_gate {
            gate.notify_one();
        }
    }

    pub fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        *self.current.lock().unwrap() = session.clone();
        self.listeners.publish(&AuthChange { event, session });
    }

    pub fn calls(&self) -> usize {
        self.get_session_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn get_session(&self) -> AppResult<Option<Session>> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.session_gate {
            gate.notified().await;
        }
        Ok(self.current.lock().unwrap().clone())
    }

    async fn get_user(&self) -> AppResult<Option<AuthUser>> {
        Ok(self.current.lock().unwrap().as_ref().map(|session| session.user.clone()))
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Session> {
        if password == "wrong" {
            return Err(AppError::InvalidCredentials);
        }
        let user_id = email.split('@').next().unwrap_or(email);
        let session = session_for(user_id, "signed-in");
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, _password: &str, metadata: serde_json::Value) -> AppResult<SignUpOutcome> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        let user_id = email.split('@').next().unwrap_or(email);
        let mut session = session_for(user_id, "signed-up");
        session.user.email = email.to_string();
        session.user.metadata = metadata;
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome {
            user: session.user.clone(),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> AppResult<()> {
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    async fn refresh_session(&self) -> AppResult<Session> {
        let current = self.current.lock().unwrap().clone();
        let user = current.ok_or(AppError::NotAuthenticated)?.user;
        let session = session_for(&user.id, "refreshed");
        self.emit(AuthChangeEvent::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    fn on_auth_change(&self) -> AuthSubscription {
        let receiver = if self.send_initial {
            let session = self.current.lock().unwrap().clone();
            self.listeners.subscribe_with(AuthChange {
                event: AuthChangeEvent::InitialSession,
                session,
            })
        } else {
            self.listeners.subscribe()
        };
        AuthSubscription::new(receiver)
    }
}

/// In-memory data store that counts every call and can be told to fail or
/// to answer slowly.
#[derive(Default)]
pub struct FakeStore {
    deals: Mutex<Vec<SalesDeal>>,
    profiles: Mutex<HashMap<String, UserProfile>>,
    changes: Subscribers<DealChange>,
    deals_failure: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    pub list_deals_calls: AtomicUsize,
    pub deal_totals_calls: AtomicUsize,
    pub insert_deal_calls: AtomicUsize,
    pub get_profile_calls: AtomicUsize,
    pub insert_profile_calls: AtomicUsize,
    pub update_profile_calls: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_deals(deals: Vec<SalesDeal>) -> Arc<Self> {
        let store = Self::default();
        *store.deals.lock().unwrap() = deals;
        Arc::new(store)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_deals(&self, message: Option<&str>) {
        *self.deals_failure.lock().unwrap() = message.map(ToString::to_string);
    }

    pub fn put_deal(&self, deal: SalesDeal) {
        self.deals.lock().unwrap().push(deal);
    }

    pub fn put_profile(&self, profile: UserProfile) {
        self.profiles.lock().unwrap().insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles.lock().unwrap().get(user_id).cloned()
    }

    /// Publishes a change with a payload that does not match the stored
    /// rows.
    pub fn push_change(&self, kind: DealChangeKind) -> usize {
        self.changes.publish(&DealChange {
            kind,
            record: Some(serde_json::json!({ "id": -1, "name": "bogus", "value": 1 })),
        })
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DataStore for FakeStore {
    async fn list_deals(&self) -> AppResult<Vec<SalesDeal>> {
        self.list_deals_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if let Some(message) = self.deals_failure.lock().unwrap().clone() {
            return Err(AppError::Backend(message));
        }
        let mut deals = self.deals.lock().unwrap().clone();
        deals.sort_by(|a, b| b.value.total_cmp(&a.value));
        Ok(deals)
    }

    async fn deal_totals(&self) -> AppResult<Vec<Metric>> {
        self.deal_totals_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut totals: HashMap<String, f64> = HashMap::new();
        for deal in self.deals.lock().unwrap().iter() {
            *totals.entry(deal.name.clone()).or_default() += deal.value;
        }
        let mut metrics: Vec<Metric> = totals
            .into_iter()
            .map(|(group_name, total_value)| Metric { group_name, total_value })
            .collect();
        metrics.sort_by(|a, b| b.total_value.total_cmp(&a.total_value));
        Ok(metrics)
    }

    async fn insert_deal(&self, name: &str, value: f64) -> AppResult<SalesDeal> {
        self.insert_deal_calls.fetch_add(1, Ordering::SeqCst);
        let mut deals = self.deals.lock().unwrap();
        let created = deal(deals.len() as i64 + 1, name, value);
        deals.push(created.clone());
        Ok(created)
    }

    async fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        self.get_profile_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.profile(user_id))
    }

    async fn insert_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        self.insert_profile_calls.fetch_add(1, Ordering::SeqCst);
        let mut profiles = self.profiles.lock().unwrap();
        if profiles.contains_key(user_id) {
            return Err(AppError::DuplicateProfile(format!("profile {} already exists", user_id)));
        }
        let profile = profile_for(user_id, name);
        profiles.insert(user_id.to_string(), profile.clone());
        Ok(profile)
    }

    async fn update_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        self.update_profile_calls.fetch_add(1, Ordering::SeqCst);
        let mut profiles = self.profiles.lock().unwrap();
        let profile = profiles
            .get_mut(user_id)
            .ok_or_else(|| AppError::Backend("profile not found".to_string()))?;
        profile.name = name.to_string();
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    fn channel(&self, name: &str) -> ChangeSubscription {
        ChangeSubscription::new(name, self.changes.subscribe())
    }
}
