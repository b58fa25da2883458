use crate::backend::{ChangeSubscription, DataStore};
use crate::errors::{AppError, AppResult};
use crate::models::{Metric, NewDeal, SalesDeal, UserProfile};
use crate::validation::validate_deal;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Runs one backend call under `limit`. Expiry fails only this call.
pub async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "backend call timed out");
            Err(AppError::Timeout(format!(
                "{} did not complete within {}ms",
                operation,
                limit.as_millis()
            )))
        }
    }
}

/// Typed query functions over the data store. Holds no state of its own.
#[derive(Clone)]
pub struct DataAccess {
    store: Arc<dyn DataStore>,
    request_timeout: Duration,
}

impl DataAccess {
    pub fn new(store: Arc<dyn DataStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn list_deals(&self) -> AppResult<Vec<SalesDeal>> {
        with_timeout("list_deals", self.request_timeout, self.store.list_deals()).await
    }

    pub async fn deal_metrics(&self) -> AppResult<Vec<Metric>> {
        with_timeout("deal_metrics", self.request_timeout, self.store.deal_totals()).await
    }

    /// Validates before anything touches the network.
    pub async fn create_deal(&self, input: &NewDeal) -> AppResult<SalesDeal> {
        let deal = validate_deal(input)?;
        let created = with_timeout(
            "create_deal",
            self.request_timeout,
            self.store.insert_deal(&deal.name, deal.value),
        )
        .await?;
        tracing::info!(deal_id = created.id, name = %created.name, "deal created");
        Ok(created)
    }

    pub async fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        with_timeout("get_profile", self.request_timeout, self.store.get_profile(user_id)).await
    }

    pub async fn create_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        with_timeout(
            "create_profile",
            self.request_timeout,
            self.store.insert_profile(user_id, name),
        )
        .await
    }

    pub async fn update_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        with_timeout(
            "update_profile",
            self.request_timeout,
            self.store.update_profile(user_id, name),
        )
        .await
    }

    /// Creates the profile row, or updates it when the row already exists.
    pub async fn ensure_profile(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        match self.create_profile(user_id, name).await {
            Ok(profile) => Ok(profile),
            Err(AppError::DuplicateProfile(detail)) => {
                tracing::debug!(user_id, detail = %detail, "profile already present, updating instead");
                self.update_profile(user_id, name).await
            }
            Err(error) => Err(error),
        }
    }

    pub fn channel(&self, name: &str) -> ChangeSubscription {
        self.store.channel(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{with_timeout, DataAccess};
    use crate::backend::local::LocalServer;
    use crate::backend::AuthProvider;
    use crate::errors::AppError;
    use crate::models::NewDeal;
    use tokio::time::Duration;

    #[tokio::test]
    async fn timeout_fails_only_the_call() {
        let err = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, AppError>(())
        })
        .await
        .expect_err("timed out");
        assert!(matches!(err, AppError::Timeout(_)));

        let ok = with_timeout("fast", Duration::from_millis(200), async { Ok::<_, AppError>(3) })
            .await
            .expect("fast call");
        assert_eq!(ok, 3);
    }

    #[tokio::test]
    async fn ensure_profile_updates_when_trigger_already_ran() {
        let server = LocalServer::in_memory(true).expect("server");
        let client = server.connect();
        let user = client
            .sign_up("a@x.com", "secret123", serde_json::json!({ "name": "placeholder" }))
            .await
            .expect("sign up")
            .user;

        let data = DataAccess::new(client.clone(), Duration::from_secs(5));
        let profile = data.ensure_profile(&user.id, "Ada").await.expect("ensure");
        assert_eq!(profile.name, "Ada");
    }

    #[tokio::test]
    async fn invalid_deal_is_rejected_before_store() {
        let server = LocalServer::in_memory(true).expect("server");
        let client = server.connect();
        let data = DataAccess::new(client.clone(), Duration::from_secs(5));

        // Anonymous client: a store call would fail with NotAuthenticated.
        let err = data
            .create_deal(&NewDeal {
                name: "".to_string(),
                value: 0.0,
            })
            .await
            .expect_err("invalid");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
