//! # Prepaid Balance Store
//!
//! SQLite ledger of prepaid users and their transactions:
//!
//! ```text
//! users(id, api_key, email, balance_cents, stripe_customer_id,
//!       created_at, updated_at)
//! transactions(id, user_id, type ∈ {topup, retirement}, amount_cents,
//!              description, stripe_session_id?, retirement_tx_hash?,
//!              credit_class?, credits_retired?, created_at)
//! ```
//!
//! `debit` is one conditional UPDATE inside a transaction: it succeeds
//! only when the pre-image balance covers the amount, so two concurrent
//! retirements can never overdraw a user.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use verdant_retire::service::{BalanceError, PrepaidBalance};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub api_key: String,
    pub email: String,
    pub balance_cents: u64,
    pub stripe_customer_id: Option<String>,
}

pub struct SqliteBalanceStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id                 TEXT PRIMARY KEY,
    api_key            TEXT NOT NULL UNIQUE,
    email              TEXT NOT NULL UNIQUE,
    balance_cents      INTEGER NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
    stripe_customer_id TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    id                 TEXT PRIMARY KEY,
    user_id            TEXT NOT NULL REFERENCES users(id),
    type               TEXT NOT NULL CHECK (type IN ('topup', 'retirement')),
    amount_cents       INTEGER NOT NULL,
    description        TEXT NOT NULL,
    stripe_session_id  TEXT,
    retirement_tx_hash TEXT,
    credit_class       TEXT,
    credits_retired    TEXT,
    created_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);
";

fn store_err(err: rusqlite::Error) -> BalanceError {
    BalanceError::Store(err.to_string())
}

impl SqliteBalanceStore {
    pub fn open(path: &str) -> Result<Self, BalanceError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| BalanceError::Store(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(store_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, BalanceError> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, BalanceError> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Find a user by (lowercased) email, creating one with a fresh API
    /// key when absent.
    pub fn find_or_create_user(
        &self,
        email: &str,
        stripe_customer_id: Option<&str>,
    ) -> Result<UserRecord, BalanceError> {
        let email = email.trim().to_lowercase();
        let conn = self.conn.lock();
        if let Some(user) = Self::user_by_email_in(&conn, &email)? {
            return Ok(user);
        }

        let now = Utc::now().to_rfc3339();
        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            api_key: format!("vk_{}", Uuid::new_v4().simple()),
            email: email.clone(),
            balance_cents: 0,
            stripe_customer_id: stripe_customer_id.map(str::to_string),
        };
        conn.execute(
            "INSERT INTO users (id, api_key, email, balance_cents, stripe_customer_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
            params![user.id, user.api_key, user.email, user.stripe_customer_id, now],
        )
        .map_err(store_err)?;
        info!(user = %user.id, "prepaid user created");
        Ok(user)
    }

    pub fn user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>, BalanceError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, api_key, email, balance_cents, stripe_customer_id
             FROM users WHERE api_key = ?1",
            params![api_key],
            row_to_user,
        )
        .optional()
        .map_err(store_err)
    }

    pub fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, BalanceError> {
        let conn = self.conn.lock();
        Self::user_by_id_in(&conn, user_id)
    }

    /// Credit a top-up and record its transaction row. Returns the new
    /// balance.
    pub fn credit(
        &self,
        user_id: &str,
        amount_cents: u64,
        description: &str,
        stripe_session_id: Option<&str>,
    ) -> Result<u64, BalanceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let now = Utc::now().to_rfc3339();
        let updated = tx
            .execute(
                "UPDATE users SET balance_cents = balance_cents + ?1, updated_at = ?2 WHERE id = ?3",
                params![amount_cents as i64, now, user_id],
            )
            .map_err(store_err)?;
        if updated == 0 {
            return Err(BalanceError::UnknownUser(user_id.to_string()));
        }
        tx.execute(
            "INSERT INTO transactions (id, user_id, type, amount_cents, description, stripe_session_id, created_at)
             VALUES (?1, ?2, 'topup', ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                amount_cents as i64,
                description,
                stripe_session_id,
                now
            ],
        )
        .map_err(store_err)?;
        let balance: i64 = tx
            .query_row(
                "SELECT balance_cents FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(balance as u64)
    }

    fn user_by_email_in(
        conn: &Connection,
        email: &str,
    ) -> Result<Option<UserRecord>, BalanceError> {
        conn.query_row(
            "SELECT id, api_key, email, balance_cents, stripe_customer_id
             FROM users WHERE email = ?1",
            params![email],
            row_to_user,
        )
        .optional()
        .map_err(store_err)
    }

    fn user_by_id_in(conn: &Connection, user_id: &str) -> Result<Option<UserRecord>, BalanceError> {
        conn.query_row(
            "SELECT id, api_key, email, balance_cents, stripe_customer_id
             FROM users WHERE id = ?1",
            params![user_id],
            row_to_user,
        )
        .optional()
        .map_err(store_err)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        api_key: row.get(1)?,
        email: row.get(2)?,
        balance_cents: row.get::<_, i64>(3)? as u64,
        stripe_customer_id: row.get(4)?,
    })
}

#[async_trait]
impl PrepaidBalance for SqliteBalanceStore {
    async fn balance_cents(&self, user_id: &str) -> Result<u64, BalanceError> {
        self.user_by_id(user_id)?
            .map(|user| user.balance_cents)
            .ok_or_else(|| BalanceError::UnknownUser(user_id.to_string()))
    }

    async fn debit(
        &self,
        user_id: &str,
        amount_cents: u64,
        tx_hash: &str,
        description: &str,
    ) -> Result<u64, BalanceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let now = Utc::now().to_rfc3339();

        // the WHERE clause is the overdraft guard: zero rows means the
        // pre-image balance did not cover the debit
        let updated = tx
            .execute(
                "UPDATE users SET balance_cents = balance_cents - ?1, updated_at = ?2
                 WHERE id = ?3 AND balance_cents >= ?1",
                params![amount_cents as i64, now, user_id],
            )
            .map_err(store_err)?;
        if updated == 0 {
            let existing = Self::user_by_id_in(&tx, user_id)?;
            return Err(match existing {
                Some(user) => BalanceError::Insufficient {
                    available_cents: user.balance_cents,
                    required_cents: amount_cents,
                },
                None => BalanceError::UnknownUser(user_id.to_string()),
            });
        }

        tx.execute(
            "INSERT INTO transactions (id, user_id, type, amount_cents, description, retirement_tx_hash, created_at)
             VALUES (?1, ?2, 'retirement', ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                amount_cents as i64,
                description,
                tx_hash,
                now
            ],
        )
        .map_err(store_err)?;

        let balance: i64 = tx
            .query_row(
                "SELECT balance_cents FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(balance as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user(cents: u64) -> (SqliteBalanceStore, UserRecord) {
        let store = SqliteBalanceStore::open_in_memory().unwrap();
        let user = store.find_or_create_user("ada@example.org", None).unwrap();
        if cents > 0 {
            store.credit(&user.id, cents, "initial topup", None).unwrap();
        }
        (store, user)
    }

    #[test]
    fn find_or_create_is_idempotent_by_email() {
        let store = SqliteBalanceStore::open_in_memory().unwrap();
        let first = store
            .find_or_create_user("Ada@Example.org", Some("cus_1"))
            .unwrap();
        let second = store.find_or_create_user("ada@example.org", None).unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.api_key.starts_with("vk_"));
    }

    #[tokio::test]
    async fn credit_then_debit_round_trip() {
        let (store, user) = store_with_user(500);
        assert_eq!(store.balance_cents(&user.id).await.unwrap(), 500);

        let remaining = store
            .debit(&user.id, 200, "CAFE", "credit retirement")
            .await
            .unwrap();
        assert_eq!(remaining, 300);
    }

    #[tokio::test]
    async fn debit_refuses_overdraft_atomically() {
        let (store, user) = store_with_user(100);
        let err = store
            .debit(&user.id, 200, "CAFE", "credit retirement")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BalanceError::Insufficient {
                available_cents: 100,
                required_cents: 200
            }
        );
        // nothing was deducted and no transaction row exists
        assert_eq!(store.balance_cents(&user.id).await.unwrap(), 100);
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM transactions WHERE type = 'retirement'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn debit_unknown_user() {
        let store = SqliteBalanceStore::open_in_memory().unwrap();
        let err = store.debit("ghost", 1, "CAFE", "x").await.unwrap_err();
        assert!(matches!(err, BalanceError::UnknownUser(_)));
    }

    #[test]
    fn api_key_lookup() {
        let (store, user) = store_with_user(0);
        let found = store.user_by_api_key(&user.api_key).unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.user_by_api_key("vk_nope").unwrap().is_none());
    }
}
