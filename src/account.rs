//! Account persistence and the free/premium download quota.
//!
//! Storage sits behind [`AccountStore`] so the ledger does not care whether
//! accounts live in a process-local map or in SQLite. Every store call runs on
//! the blocking pool because the SQLite backend does real IO.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::security::credential_digest;

pub const DEFAULT_FREE_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
}

impl PlanTier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Normalized email address.
    pub id: String,
    pub plan: PlanTier,
    pub downloads_consumed: u32,
    pub credential: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: String, credential: String) -> Self {
        Self {
            id,
            plan: PlanTier::Free,
            downloads_consumed: 0,
            credential,
            created_at: Utc::now(),
        }
    }

    pub fn is_premium(&self) -> bool {
        self.plan == PlanTier::Premium
    }

    pub fn view(&self) -> AccountView {
        AccountView {
            email: self.id.clone(),
            is_premium: self.is_premium(),
            download_count: self.downloads_consumed,
        }
    }
}

/// The account object the web client expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub email: String,
    pub is_premium: bool,
    pub download_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("User not found")]
    NotFound,
    #[error("User already exists")]
    AlreadyExists,
    #[error("Invalid credentials")]
    BadCredentials,
    #[error("Email and password are required")]
    MissingCredentials,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Minimal storage contract. Implementations must make
/// `increment_downloads` atomic per account.
pub trait AccountStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Account>>;

    /// Inserts a new account. Returns `false` if the id is already taken.
    fn insert(&self, account: &Account) -> Result<bool>;

    fn set_plan(&self, id: &str, plan: PlanTier) -> Result<Option<Account>>;

    /// Adds one to the consumed counter (saturating) and returns the updated
    /// account, or `None` when the id is unknown.
    fn increment_downloads(&self, id: &str) -> Result<Option<Account>>;
}

/// Process-local store. Everything is lost on restart.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().get(id).cloned())
    }

    fn insert(&self, account: &Account) -> Result<bool> {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&account.id) {
            return Ok(false);
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(true)
    }

    fn set_plan(&self, id: &str, plan: PlanTier) -> Result<Option<Account>> {
        let mut accounts = self.accounts.write();
        Ok(accounts.get_mut(id).map(|account| {
            account.plan = plan;
            account.clone()
        }))
    }

    fn increment_downloads(&self, id: &str) -> Result<Option<Account>> {
        let mut accounts = self.accounts.write();
        Ok(accounts.get_mut(id).map(|account| {
            account.downloads_consumed = account.downloads_consumed.saturating_add(1);
            account.clone()
        }))
    }
}

/// SQLite-backed store so accounts survive restarts.
pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
}

impl SqliteAccountStore {
    /// Opens (and if necessary creates) the database and its schema. WAL mode
    /// keeps readers from blocking the single writer.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating account directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening account DB {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for account DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting account DB synchronous mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                plan TEXT NOT NULL DEFAULT 'free',
                downloads_consumed INTEGER NOT NULL DEFAULT 0,
                credential TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("creating accounts table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Account>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, plan, downloads_consumed, credential, created_at
            FROM accounts
            WHERE id = ?1
            "#,
        )?;
        let raw = stmt.query_row([id], row_to_raw).optional()?;
        raw.map(RawAccount::into_account).transpose()
    }
}

impl AccountStore for SqliteAccountStore {
    fn get(&self, id: &str) -> Result<Option<Account>> {
        Self::fetch(&self.conn.lock(), id)
    }

    fn insert(&self, account: &Account) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                r#"
                INSERT INTO accounts (id, plan, downloads_consumed, credential, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![
                    account.id,
                    account.plan.as_str(),
                    account.downloads_consumed,
                    account.credential,
                    account.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("inserting account {}", account.id))?;
        Ok(inserted == 1)
    }

    fn set_plan(&self, id: &str, plan: PlanTier) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET plan = ?2 WHERE id = ?1",
            params![id, plan.as_str()],
        )
        .with_context(|| format!("updating plan for {id}"))?;
        Self::fetch(&conn, id)
    }

    fn increment_downloads(&self, id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE accounts
            SET downloads_consumed = MIN(downloads_consumed + 1, 4294967295)
            WHERE id = ?1
            "#,
            params![id],
        )
        .with_context(|| format!("incrementing downloads for {id}"))?;
        Self::fetch(&conn, id)
    }
}

/// Row values before the plan/timestamp columns are validated.
struct RawAccount {
    id: String,
    plan: String,
    downloads_consumed: u32,
    credential: String,
    created_at: String,
}

impl RawAccount {
    fn into_account(self) -> Result<Account> {
        let plan = PlanTier::parse(&self.plan)
            .ok_or_else(|| anyhow!("unknown plan {:?} for {}", self.plan, self.id))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .with_context(|| format!("parsing created_at for {}", self.id))?
            .with_timezone(&Utc);
        Ok(Account {
            id: self.id,
            plan,
            downloads_consumed: self.downloads_consumed,
            credential: self.credential,
            created_at,
        })
    }
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawAccount> {
    Ok(RawAccount {
        id: row.get("id")?,
        plan: row.get("plan")?,
        downloads_consumed: row.get("downloads_consumed")?,
        credential: row.get("credential")?,
        created_at: row.get("created_at")?,
    })
}

/// Trims and lower-cases an email so `U1@Test.com ` and `u1@test.com` are the
/// same account.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Quota rule: premium is unlimited, free stops at `free_limit`.
fn allows_download(account: &Account, free_limit: u32) -> bool {
    account.is_premium() || account.downloads_consumed < free_limit
}

/// Entitlement checks and account mutations on top of an [`AccountStore`].
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn AccountStore>,
    free_limit: u32,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn AccountStore>, free_limit: u32) -> Self {
        Self { store, free_limit }
    }

    pub fn in_memory(free_limit: u32) -> Self {
        Self::new(Arc::new(InMemoryAccountStore::new()), free_limit)
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let id = normalize_email(email);
        if id.is_empty() || password.is_empty() {
            return Err(AccountError::MissingCredentials);
        }
        let account = Account::new(id.clone(), credential_digest(&id, password));
        self.run_blocking(move |store| {
            if store.insert(&account)? {
                Ok(account)
            } else {
                Err(AccountError::AlreadyExists)
            }
        })
        .await
    }

    pub async fn verify(&self, email: &str, password: &str) -> Result<Account, AccountError> {
        let id = normalize_email(email);
        let digest = credential_digest(&id, password);
        self.run_blocking(move |store| match store.get(&id)? {
            Some(account) if account.credential == digest => Ok(account),
            _ => Err(AccountError::BadCredentials),
        })
        .await
    }

    pub async fn account(&self, id: &str) -> Result<Account, AccountError> {
        let id = id.to_owned();
        self.run_blocking(move |store| store.get(&id)?.ok_or(AccountError::NotFound))
            .await
    }

    pub async fn can_download(&self, id: &str) -> Result<bool, AccountError> {
        let account = self.account(id).await?;
        Ok(allows_download(&account, self.free_limit))
    }

    /// Counts one finished download. Premium accounts are left untouched.
    pub async fn record_download(&self, id: &str) -> Result<Account, AccountError> {
        let id = id.to_owned();
        self.run_blocking(move |store| {
            let account = store.get(&id)?.ok_or(AccountError::NotFound)?;
            if account.is_premium() {
                return Ok(account);
            }
            store
                .increment_downloads(&id)?
                .ok_or(AccountError::NotFound)
        })
        .await
    }

    pub async fn upgrade(&self, id: &str) -> Result<Account, AccountError> {
        let id = id.to_owned();
        self.run_blocking(move |store| {
            store
                .set_plan(&id, PlanTier::Premium)?
                .ok_or(AccountError::NotFound)
        })
        .await
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, AccountError>
    where
        F: FnOnce(&dyn AccountStore) -> Result<T, AccountError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|err| AccountError::Storage(anyhow!("task join error: {err}")))?
    }
}
