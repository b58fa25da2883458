use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Admin,
    Member,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuthUser {
    pub fn metadata_name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(|value| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: AuthUser,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesDeal {
    pub id: i64,
    pub name: String,
    pub value: f64,
    pub user_id: Option<String>,
    pub created_by: Option<String>,
}

/// Sum of deal values for every deal sharing a name. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub group_name: String,
    pub total_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeal {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpPayload {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl AuthChangeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
        }
    }
}

/// Push notification from the auth provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DealChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change notice. The record is whatever the backend chose to
/// attach and is never treated as authoritative data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealChange {
    pub kind: DealChangeKind,
    pub record: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::{AuthChange, AuthChangeEvent, AuthUser, Session};
    use chrono::{Duration, Utc};

    #[test]
    fn session_expiry_is_inclusive() {
        let now = Utc::now();
        let session = Session {
            user: AuthUser {
                id: "u-1".to_string(),
                email: "a@x.com".to_string(),
                metadata: serde_json::json!({ "name": "Ada" }),
            },
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: now,
        };
        assert!(session.is_expired(now));
        assert!(!session.is_expired(now - Duration::seconds(1)));
        assert_eq!(session.user.metadata_name(), Some("Ada"));
    }

    #[test]
    fn auth_change_uses_provider_event_names() {
        let change = AuthChange {
            event: AuthChangeEvent::TokenRefreshed,
            session: None,
        };
        let json = serde_json::to_value(&change).expect("serialize");
        assert_eq!(json["event"], "TOKEN_REFRESHED");
        assert_eq!(AuthChangeEvent::SignedOut.as_str(), "SIGNED_OUT");
    }
}
