// ===============================
// src/ledger.rs (balance ledger client)
// ===============================
//
// Two implementations behind one trait:
// - HttpLedger   : JSON over HTTP to the wallet service (LEDGER_URL)
// - MemoryLedger : in-process book, used when LEDGER_URL is unset and by tests
//
// Every change carries an idempotency key; applying the same key twice
// returns the first transaction instead of booking again.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rejected {key}: HTTP {status} {body}")]
    Rejected { key: String, status: u16, body: String },
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("bad ledger response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LedgerError::Decode(e.to_string())
        } else {
            LedgerError::Transport(e.to_string())
        }
    }
}

/// One balance movement; a zero field leaves that side untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    pub user_id: String,
    pub asset_id: String,
    pub value_change: Decimal,
    pub locked_value_change: Decimal,
    pub category: String,
    pub note: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub idempotency_key: String,
}

impl BalanceChange {
    /// Entry that undoes this one.
    pub fn inverse(&self) -> BalanceChange {
        BalanceChange {
            value_change: -self.value_change,
            locked_value_change: -self.locked_value_change,
            note: format!("ROLLBACK {}", self.note),
            idempotency_key: format!("{}:rollback", self.idempotency_key),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub change: BalanceChange,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn change_balance(&self, change: &BalanceChange) -> Result<Transaction, LedgerError>;

    /// Books the inverse of every given transaction; returns the compensating entries.
    async fn rollback(&self, transactions: &[Transaction]) -> Result<Vec<Transaction>, LedgerError>;
}

// ---- HTTP ----

pub struct HttpLedger {
    http: reqwest::Client,
    base: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct RollbackRequest<'a> {
    transactions: &'a [Transaction],
}

impl HttpLedger {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string(), timeout })
    }

    async fn post<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        body: &B,
    ) -> Result<T, LedgerError> {
        let url = format!("{}{}", self.base, path);
        let rsp = self
            .http
            .post(url)
            .header("Idempotency-Key", key)
            .json(body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { LedgerError::Timeout(self.timeout) } else { e.into() })?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected { key: key.to_string(), status: status.as_u16(), body });
        }
        Ok(rsp.json::<T>().await?)
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn change_balance(&self, change: &BalanceChange) -> Result<Transaction, LedgerError> {
        self.post("/balances/change", &change.idempotency_key, change).await
    }

    async fn rollback(&self, transactions: &[Transaction]) -> Result<Vec<Transaction>, LedgerError> {
        let key = transactions.iter().map(|t| t.id.as_str()).collect::<Vec<_>>().join(",");
        self.post("/balances/rollback", &format!("rollback:{key}"), &RollbackRequest { transactions }).await
    }
}

// ---- In-memory ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    /// Total holdings, including the locked part.
    pub value: Decimal,
    pub locked: Decimal,
}

impl Balance {
    #[cfg(test)]
    pub fn available(&self) -> Decimal {
        self.value - self.locked
    }
}

#[derive(Debug, Default)]
struct Book {
    balances: HashMap<(String, String), Balance>,
    by_key: HashMap<String, Transaction>,
    journal: Vec<Transaction>,
    next_id: u64,
    // idempotency-key suffix -> remaining injected failures
    fail_on: HashMap<String, u32>,
    fail_rollbacks: u32,
}

impl Book {
    fn book(&mut self, change: &BalanceChange) -> Transaction {
        if let Some(tx) = self.by_key.get(&change.idempotency_key) {
            debug!(key = %change.idempotency_key, "ledger: duplicate key, returning first booking");
            return tx.clone();
        }
        let bal = self.balances.entry((change.user_id.clone(), change.asset_id.clone())).or_default();
        bal.value += change.value_change;
        bal.locked += change.locked_value_change;
        self.next_id += 1;
        let tx = Transaction { id: format!("tx-{}", self.next_id), change: change.clone() };
        self.by_key.insert(change.idempotency_key.clone(), tx.clone());
        self.journal.push(tx.clone());
        tx
    }

    fn injected_failure(&mut self, key: &str) -> bool {
        let Some(step) = key.rsplit(':').next() else { return false };
        match self.fail_on.get_mut(step) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    book: Mutex<Book>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn deposit(&self, user_id: &str, asset_id: &str, value: Decimal, locked: Decimal) {
        let mut book = self.book.lock().await;
        let bal = book.balances.entry((user_id.to_string(), asset_id.to_string())).or_default();
        bal.value += value;
        bal.locked += locked;
    }

    #[cfg(test)]
    pub async fn balance(&self, user_id: &str, asset_id: &str) -> Balance {
        self.book
            .lock()
            .await
            .balances
            .get(&(user_id.to_string(), asset_id.to_string()))
            .copied()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn journal(&self) -> Vec<Transaction> {
        self.book.lock().await.journal.clone()
    }

    /// Makes the next `times` changes whose key ends in `:<step>` fail.
    #[cfg(test)]
    pub async fn fail_step(&self, step: &str, times: u32) {
        self.book.lock().await.fail_on.insert(step.to_string(), times);
    }

    #[cfg(test)]
    pub async fn fail_rollbacks(&self, times: u32) {
        self.book.lock().await.fail_rollbacks = times;
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn change_balance(&self, change: &BalanceChange) -> Result<Transaction, LedgerError> {
        let mut book = self.book.lock().await;
        if book.injected_failure(&change.idempotency_key) {
            warn!(key = %change.idempotency_key, "ledger: injected failure");
            return Err(LedgerError::Unavailable(format!("injected failure for {}", change.idempotency_key)));
        }
        Ok(book.book(change))
    }

    async fn rollback(&self, transactions: &[Transaction]) -> Result<Vec<Transaction>, LedgerError> {
        let mut book = self.book.lock().await;
        if book.fail_rollbacks > 0 {
            book.fail_rollbacks -= 1;
            return Err(LedgerError::Unavailable("injected rollback failure".into()));
        }
        // newest first
        Ok(transactions.iter().rev().map(|t| book.book(&t.change.inverse())).collect())
    }
}
