//! Realtime refresh controller for the deals dashboard.
//!
//! Change notifications on the deals channel are treated purely as
//! invalidation: each one schedules a full reload of deals and metrics,
//! never a patch from the notification payload.

use crate::config::RefreshPolicy;
use crate::data_access::DataAccess;
use crate::errors::{AppError, AppResult};
use crate::models::{Metric, NewDeal, SalesDeal};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Initial load and manual retry; raises `loading`.
    Foreground,
    /// Realtime or post-create reload; raises `is_syncing` only.
    Background,
}

impl FetchKind {
    fn merge(current: Option<Self>, next: Self) -> Self {
        match (current, next) {
            (Some(Self::Foreground), _) | (_, Self::Foreground) => Self::Foreground,
            _ => Self::Background,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DashboardState {
    pub deals: Vec<SalesDeal>,
    pub metrics: Vec<Metric>,
    pub loading: bool,
    pub is_syncing: bool,
    pub error: Option<String>,
    pub completed_fetches: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FetchBook {
    issued: u64,
    applied: u64,
    foreground: usize,
    background: usize,
}

#[derive(Clone)]
pub struct DealsController {
    data: DataAccess,
    policy: RefreshPolicy,
    state: Arc<watch::Sender<DashboardState>>,
    book: Arc<Mutex<FetchBook>>,
    pending: Arc<Mutex<Option<FetchKind>>>,
    notify: Arc<Notify>,
    alive: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DealsController {
    /// Mounts the controller: subscribes to `channel` and starts the
    /// initial foreground load.
    pub fn start(data: DataAccess, channel: &str, policy: RefreshPolicy) -> Self {
        let (state, _) = watch::channel(DashboardState {
            loading: true,
            ..DashboardState::default()
        });
        let controller = Self {
            data,
            policy,
            state: Arc::new(state),
            book: Arc::new(Mutex::new(FetchBook::default())),
            pending: Arc::new(Mutex::new(None)),
            notify: Arc::new(Notify::new()),
            alive: Arc::new(AtomicBool::new(true)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        let mut subscription = controller.data.channel(channel);
        let listener = {
            let controller = controller.clone();
            tokio::spawn(async move {
                while let Some(change) = subscription.recv().await {
                    if !controller.alive.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::debug!(channel = subscription.channel(), kind = ?change.kind, "deal change received");
                    controller.request(FetchKind::Background);
                }
            })
        };
        controller.track(listener);

        if controller.policy == RefreshPolicy::Coalesce {
            let worker = {
                let controller = controller.clone();
                tokio::spawn(async move { controller.run_loop().await })
            };
            controller.track(worker);
        }

        controller.request(FetchKind::Foreground);
        controller
    }

    pub fn snapshot(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state.subscribe()
    }

    /// Waits until at least `count` fetch pairs have settled.
    pub async fn wait_for_fetches(&self, count: u64) -> DashboardState {
        let mut receiver = self.subscribe();
        let settled = match receiver.wait_for(|state| state.completed_fetches >= count).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    /// Success callback after a local write; does not wait for the
    /// realtime notification to arrive.
    pub fn refresh_background(&self) {
        self.request(FetchKind::Background);
    }

    pub fn retry(&self) {
        self.request(FetchKind::Foreground);
    }

    pub async fn create_deal(&self, input: &NewDeal) -> AppResult<SalesDeal> {
        let deal = self.data.create_deal(input).await?;
        self.refresh_background();
        Ok(deal)
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Unmount: drops the realtime subscription and stops scheduling.
    /// Fetches already in flight finish without touching state.
    pub fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        tracing::debug!("deals controller stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn request(&self, kind: FetchKind) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        match self.policy {
            RefreshPolicy::Coalesce => {
                {
                    let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                    *pending = Some(FetchKind::merge(*pending, kind));
                }
                self.notify.notify_one();
            }
            RefreshPolicy::PerNotification => {
                let controller = self.clone();
                let handle = tokio::spawn(async move { controller.fetch(kind).await });
                self.track(handle);
            }
        }
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
            let next = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(kind) = next {
                self.fetch(kind).await;
            }
        }
    }

    async fn fetch(&self, kind: FetchKind) {
        let Some(sequence) = self.begin(kind) else {
            return;
        };
        let (deals, metrics) = tokio::join!(self.data.list_deals(), self.data.deal_metrics());
        self.finish(kind, sequence, deals, metrics);
    }

    fn begin(&self, kind: FetchKind) -> Option<u64> {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        book.issued += 1;
        match kind {
            FetchKind::Foreground => book.foreground += 1,
            FetchKind::Background => book.background += 1,
        }
        let (loading, syncing) = (book.foreground > 0, book.background > 0);
        self.state.send_modify(|state| {
            state.loading = loading;
            state.is_syncing = syncing;
        });
        tracing::debug!(sequence = book.issued, ?kind, "fetching deals and metrics");
        Some(book.issued)
    }

    fn finish(
        &self,
        kind: FetchKind,
        sequence: u64,
        deals: AppResult<Vec<SalesDeal>>,
        metrics: AppResult<Vec<Metric>>,
    ) {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        match kind {
            FetchKind::Foreground => book.foreground = book.foreground.saturating_sub(1),
            FetchKind::Background => book.background = book.background.saturating_sub(1),
        }

        let outcome = if sequence > book.applied {
            book.applied = sequence;
            Some(match (deals, metrics) {
                (Ok(deals), Ok(metrics)) => Ok((deals, metrics)),
                (Err(error), _) | (_, Err(error)) => Err(error),
            })
        } else {
            tracing::debug!(sequence, applied = book.applied, "dropped stale fetch result");
            None
        };

        let (loading, syncing) = (book.foreground > 0, book.background > 0);
        self.state.send_modify(|state| {
            state.loading = loading;
            state.is_syncing = syncing;
            state.completed_fetches += 1;
            match outcome {
                Some(Ok((deals, metrics))) => {
                    state.deals = deals;
                    state.metrics = metrics;
                    state.error = None;
                    state.last_synced_at = Some(Utc::now());
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, ?kind, "dashboard refresh failed; keeping previous data");
                    state.error = Some(display_error(&error));
                }
                None => {}
            }
        });
    }
}

fn display_error(error: &AppError) -> String {
    error.display_message()
}
