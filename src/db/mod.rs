use crate::errors::{AppError, AppResult};
use crate::models::{AccountType, AuthUser, Metric, SalesDeal, Session, UserProfile};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    pub fn in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn create_auth_user(
        &self,
        email: &str,
        password_hash: &str,
        metadata: &serde_json::Value,
    ) -> AppResult<AuthUser> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO auth_users (id, email, password_hash, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                email,
                password_hash,
                serde_json::to_string(metadata)?,
                Utc::now().to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => Ok(AuthUser {
                id,
                email: email.to_string(),
                metadata: metadata.clone(),
            }),
            Err(error) if is_unique_violation(&error) => {
                Err(AppError::Backend("User already registered".to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Returns the user together with the stored password hash.
    pub fn find_auth_user_by_email(&self, email: &str) -> AppResult<Option<(AuthUser, String)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, metadata_json, password_hash FROM auth_users WHERE email = ?1",
            [email],
            |row| Ok((parse_auth_user_row(row)?, row.get::<_, String>(3)?)),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_auth_user(&self, user_id: &str) -> AppResult<Option<AuthUser>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, metadata_json FROM auth_users WHERE id = ?1",
            [user_id],
            parse_auth_user_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn insert_session(&self, session: &Session) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO auth_sessions (access_token, refresh_token, user_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.access_token,
                session.refresh_token,
                session.user.id,
                session.expires_at.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Consumes a refresh token, returning the owning user id.
    pub fn take_refresh_token(&self, refresh_token: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM auth_sessions WHERE refresh_token = ?1",
                [refresh_token],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if user_id.is_some() {
            conn.execute(
                "DELETE FROM auth_sessions WHERE refresh_token = ?1",
                [refresh_token],
            )?;
        }
        Ok(user_id)
    }

    pub fn delete_session(&self, access_token: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM auth_sessions WHERE access_token = ?1",
            [access_token],
        )?;
        Ok(removed > 0)
    }

    pub fn session_is_active(&self, access_token: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.lock()?;
        let expires_at = conn
            .query_row(
                "SELECT expires_at FROM auth_sessions WHERE access_token = ?1",
                [access_token],
                |row| parse_time(&row.get::<_, String>(0)?),
            )
            .optional()?;
        Ok(expires_at.map(|at| at > now).unwrap_or(false))
    }

    pub fn insert_profile(
        &self,
        user_id: &str,
        name: &str,
        account_type: AccountType,
    ) -> AppResult<UserProfile> {
        let now = Utc::now();
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO user_profiles (id, name, account_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, name, account_type.as_str(), now.to_rfc3339()],
        );
        match inserted {
            Ok(_) => Ok(UserProfile {
                id: user_id.to_string(),
                name: name.to_string(),
                account_type,
                created_at: now,
                updated_at: now,
            }),
            Err(error) if is_unique_violation(&error) => Err(AppError::DuplicateProfile(format!(
                "duplicate key value violates unique constraint \"user_profiles_pkey\" (id={})",
                user_id
            ))),
            Err(error) => Err(error.into()),
        }
    }

    pub fn get_profile(&self, user_id: &str) -> AppResult<Option<UserProfile>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, account_type, created_at, updated_at FROM user_profiles WHERE id = ?1",
            [user_id],
            parse_profile_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn update_profile_name(&self, user_id: &str, name: &str) -> AppResult<UserProfile> {
        {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE user_profiles SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, Utc::now().to_rfc3339(), user_id],
            )?;
            if updated == 0 {
                return Err(AppError::Backend(format!("Profile {} not found", user_id)));
            }
        }
        self.get_profile(user_id)?
            .ok_or_else(|| AppError::Backend(format!("Profile {} not found", user_id)))
    }

    pub fn set_account_type(&self, user_id: &str, account_type: AccountType) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE user_profiles SET account_type = ?1, updated_at = ?2 WHERE id = ?3",
            params![account_type.as_str(), Utc::now().to_rfc3339(), user_id],
        )?;
        Ok(())
    }

    pub fn delete_profile(&self, user_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM user_profiles WHERE id = ?1", [user_id])?;
        Ok(removed > 0)
    }

    pub fn insert_deal(&self, name: &str, value: f64, user_id: &str) -> AppResult<SalesDeal> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sales_deals (name, value, user_id) VALUES (?1, ?2, ?3)",
            params![name, value, user_id],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            "SELECT d.id, d.name, d.value, d.user_id, p.name
             FROM sales_deals d
             LEFT JOIN user_profiles p ON p.id = d.user_id
             WHERE d.id = ?1",
            [id],
            parse_deal_row,
        )
        .map_err(AppError::from)
    }

    pub fn delete_deal(&self, deal_id: i64) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM sales_deals WHERE id = ?1", [deal_id])?;
        Ok(removed > 0)
    }

    pub fn list_deals(&self) -> AppResult<Vec<SalesDeal>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.name, d.value, d.user_id, p.name
             FROM sales_deals d
             LEFT JOIN user_profiles p ON p.id = d.user_id
             ORDER BY d.value DESC, d.id ASC",
        )?;
        let rows = stmt.query_map([], parse_deal_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn deal_totals(&self) -> AppResult<Vec<Metric>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, SUM(value) AS total
             FROM sales_deals
             GROUP BY name
             ORDER BY total DESC, name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Metric {
                group_name: row.get(0)?,
                total_value: row.get(1)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(inner, _) => {
            inner.code == rusqlite::ErrorCode::ConstraintViolation
                && (inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

fn parse_auth_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuthUser> {
    Ok(AuthUser {
        id: row.get(0)?,
        email: row.get(1)?,
        metadata: serde_json::from_str::<serde_json::Value>(&row.get::<_, String>(2)?)
            .unwrap_or(serde_json::json!({})),
    })
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        account_type: parse_account_type(&row.get::<_, String>(2)?)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        updated_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_deal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SalesDeal> {
    Ok(SalesDeal {
        id: row.get(0)?,
        name: row.get(1)?,
        value: row.get(2)?,
        user_id: row.get(3)?,
        created_by: row.get(4)?,
    })
}

fn parse_account_type(raw: &str) -> rusqlite::Result<AccountType> {
    match raw {
        "admin" => Ok(AccountType::Admin),
        "member" => Ok(AccountType::Member),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown account type: {}", other),
            )),
        )),
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::AccountType;

    fn seeded_user(db: &Database, email: &str) -> String {
        db.create_auth_user(email, "hash", &serde_json::json!({}))
            .expect("create user")
            .id
    }

    #[test]
    fn database_creates_file_and_lists_deals_by_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("test.db");
        let db = Database::new(&db_path).expect("db");
        assert!(db_path.exists());
        assert_eq!(db.path(), Some(db_path.as_path()));

        let user_id = seeded_user(&db, "a@x.com");
        db.insert_profile(&user_id, "Ada", AccountType::Member)
            .expect("profile");
        db.insert_deal("Acme", 100.0, &user_id).expect("deal");
        db.insert_deal("Globex", 900.0, &user_id).expect("deal");

        let deals = db.list_deals().expect("list deals");
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0].name, "Globex");
        assert_eq!(deals[0].created_by.as_deref(), Some("Ada"));
    }

    #[test]
    fn duplicate_profile_is_reported_distinctly() {
        let db = Database::in_memory().expect("db");
        let user_id = seeded_user(&db, "a@x.com");
        db.insert_profile(&user_id, "Ada", AccountType::Member)
            .expect("first insert");

        let err = db
            .insert_profile(&user_id, "Ada", AccountType::Member)
            .expect_err("duplicate");
        assert!(matches!(err, AppError::DuplicateProfile(_)));
    }

    #[test]
    fn duplicate_email_is_rejected() {
        let db = Database::in_memory().expect("db");
        seeded_user(&db, "a@x.com");
        let err = db
            .create_auth_user("a@x.com", "hash", &serde_json::json!({}))
            .expect_err("duplicate email");
        assert_eq!(err.to_string(), "User already registered");
    }

    #[test]
    fn totals_group_by_deal_name() {
        let db = Database::in_memory().expect("db");
        let user_id = seeded_user(&db, "a@x.com");
        db.insert_profile(&user_id, "Ada", AccountType::Member)
            .expect("profile");
        db.insert_deal("Acme", 100.0, &user_id).expect("deal");
        db.insert_deal("Acme", 250.0, &user_id).expect("deal");
        db.insert_deal("Globex", 300.0, &user_id).expect("deal");

        let totals = db.deal_totals().expect("totals");
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].group_name, "Acme");
        assert_eq!(totals[0].total_value, 350.0);
        assert_eq!(totals[1].total_value, 300.0);
    }

    #[test]
    fn deleting_profile_orphans_deals() {
        let db = Database::in_memory().expect("db");
        let user_id = seeded_user(&db, "a@x.com");
        db.insert_profile(&user_id, "Ada", AccountType::Member)
            .expect("profile");
        db.insert_deal("Acme", 100.0, &user_id).expect("deal");

        assert!(db.delete_profile(&user_id).expect("delete profile"));
        let deals = db.list_deals().expect("list deals");
        assert_eq!(deals.len(), 1);
        assert!(deals[0].user_id.is_none());
        assert!(deals[0].created_by.is_none());
    }

    #[test]
    fn refresh_tokens_are_single_use() {
        let db = Database::in_memory().expect("db");
        let user_id = seeded_user(&db, "a@x.com");
        let user = db.get_auth_user(&user_id).expect("get").expect("exists");
        let session = crate::models::Session {
            user,
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
        };
        db.insert_session(&session).expect("insert session");
        assert!(db
            .session_is_active("access", chrono::Utc::now())
            .expect("active"));

        assert_eq!(
            db.take_refresh_token("refresh").expect("take"),
            Some(user_id)
        );
        assert_eq!(db.take_refresh_token("refresh").expect("take again"), None);
    }
}
