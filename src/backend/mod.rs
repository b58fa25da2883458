pub mod local;
pub mod password;

use crate::errors::AppResult;
use crate::models::{AuthChange, AuthUser, DealChange, Metric, SalesDeal, Session, UserProfile};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct SignUpOutcome {
    pub user: AuthUser,
    /// Absent when the provider requires email confirmation first.
    pub session: Option<Session>,
}

/// Hosted auth provider surface.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_session(&self) -> AppResult<Option<Session>>;
    async fn get_user(&self) -> AppResult<Option<AuthUser>>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<Session>;
    async fn sign_up(&self, email: &str, password: &str, metadata: serde_json::Value) -> AppResult<SignUpOutcome>;
    async fn sign_out(&self) -> AppResult<()>;
    async fn refresh_session(&self) -> AppResult<Session>;

    /// Registers for auth change notifications. The first message is always
    /// `INITIAL_SESSION` carrying whatever session the provider holds.
    fn on_auth_change(&self) -> AuthSubscription;
}

/// Query surface of the hosted data store. Row-level rules are enforced on
/// the other side of this trait.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn list_deals(&self) -> AppResult<Vec<SalesDeal>>;
    async fn deal_totals(&self) -> AppResult<Vec<Metric>>;
    async fn insert_deal(&self, name: &str, value: f64) -> AppResult<SalesDeal>;
    async fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>>;
    async fn insert_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile>;
    async fn update_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile>;

    /// Subscribes to every change on the deals collection.
    fn channel(&self, name: &str) -> ChangeSubscription;
}

pub struct AuthSubscription {
    receiver: mpsc::UnboundedReceiver<AuthChange>,
}

impl AuthSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<AuthChange>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<AuthChange> {
        self.receiver.recv().await
    }
}

/// Live change subscription. Dropping it unsubscribes.
pub struct ChangeSubscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<DealChange>,
}

impl ChangeSubscription {
    pub fn new(channel: &str, receiver: mpsc::UnboundedReceiver<DealChange>) -> Self {
        Self {
            channel: channel.to_string(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<DealChange> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Fan-out list of notification receivers. Closed receivers are pruned on
/// the next publish.
pub struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Like `subscribe`, but `initial` is queued for this receiver only.
    pub fn subscribe_with(&self, initial: T) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(initial);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub fn publish(&self, value: &T) -> usize {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|sender| sender.send(value.clone()).is_ok());
        senders.len()
    }

    pub fn active(&self) -> usize {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|sender| !sender.is_closed());
        senders.len()
    }
}
