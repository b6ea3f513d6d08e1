//! Pool of authenticated Telegram sessions.
//!
//! Each registered account pairs its metadata with the gateway handle bound
//! to that session. The pool is the mutual-exclusion point: a capacity-1
//! lease per account guarantees at most one in-flight request per session.
//! Rotation policy lives with the caller; on `FloodWait` the pool only
//! records the cooldown and the caller decides between sleeping and swapping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::TelegramGateway;
use crate::store::now_unix;
use crate::types::error::{Result, SpectraError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Cooldown,
    Banned,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cooldown => "cooldown",
            Self::Banned => "banned",
        }
    }
}

/// Operator-facing snapshot of one account.
#[derive(Clone, Debug)]
pub struct AccountStats {
    pub session_name: String,
    pub phone: String,
    pub status: AccountStatus,
    pub cooldown_until: Option<i64>,
    pub usage_count: u64,
    pub last_error: Option<String>,
}

struct PoolEntry {
    session_name: String,
    phone: String,
    status: AccountStatus,
    cooldown_until: Option<i64>,
    usage_count: u64,
    last_error: Option<String>,
    gateway: Arc<dyn TelegramGateway>,
    lease: Arc<Semaphore>,
}

impl PoolEntry {
    fn matches(&self, identifier: &str) -> bool {
        self.session_name == identifier || (!self.phone.is_empty() && self.phone == identifier)
    }

    fn refresh_cooldown(&mut self, now: i64) {
        if self.status == AccountStatus::Cooldown {
            if let Some(until) = self.cooldown_until {
                if now >= until {
                    self.status = AccountStatus::Active;
                    self.cooldown_until = None;
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// An account checked out of the pool. Dropping the lease returns the
/// session's capacity.
pub struct AccountLease {
    pub session_name: String,
    pub gateway: Arc<dyn TelegramGateway>,
    _permit: OwnedSemaphorePermit,
}

pub struct AccountPool {
    entries: Mutex<Vec<PoolEntry>>,
    cursor: AtomicUsize,
}

impl AccountPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Register every configured account with the gateway bound to its
    /// session. The order of registration is the rotation order.
    pub async fn register_from_config(
        &self,
        config: &Config,
        mut connect: impl FnMut(&crate::config::AccountConfig) -> Arc<dyn TelegramGateway>,
    ) {
        for account in &config.accounts {
            let gateway = connect(account);
            self.register(&account.session_name, &account.phone, gateway)
                .await;
        }
    }

    pub async fn register(
        &self,
        session_name: &str,
        phone: &str,
        gateway: Arc<dyn TelegramGateway>,
    ) {
        let mut entries = self.entries.lock().await;
        entries.push(PoolEntry {
            session_name: session_name.to_string(),
            phone: phone.to_string(),
            status: AccountStatus::Active,
            cooldown_until: None,
            usage_count: 0,
            last_error: None,
            gateway,
            lease: Arc::new(Semaphore::new(1)),
        });
        info!(session = session_name, "registered account");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Select an account: the preferred one when named and healthy, otherwise
    /// round-robin over active accounts. Waits for the chosen session's
    /// capacity so one request per account is structural.
    pub async fn select(&self, preferred: Option<&str>) -> Result<AccountLease> {
        let (session_name, gateway, lease) = {
            let mut entries = self.entries.lock().await;
            if entries.is_empty() {
                return Err(SpectraError::NoAccountAvailable);
            }

            let now = now_unix();
            for entry in entries.iter_mut() {
                entry.refresh_cooldown(now);
            }

            let chosen = match preferred {
                Some(identifier) => {
                    let exact = entries
                        .iter()
                        .position(|e| e.matches(identifier) && e.is_healthy());
                    match exact {
                        Some(idx) => Some(idx),
                        None => {
                            warn!(
                                account = identifier,
                                "preferred account unavailable, rotating"
                            );
                            self.next_healthy(&entries)
                        }
                    }
                }
                None => self.next_healthy(&entries),
            };

            let Some(idx) = chosen else {
                return Err(SpectraError::NoAccountAvailable);
            };

            let entry = &mut entries[idx];
            entry.usage_count += 1;
            (
                entry.session_name.clone(),
                Arc::clone(&entry.gateway),
                Arc::clone(&entry.lease),
            )
        };

        let permit = lease
            .acquire_owned()
            .await
            .map_err(|_| SpectraError::NoAccountAvailable)?;

        Ok(AccountLease {
            session_name,
            gateway,
            _permit: permit,
        })
    }

    fn next_healthy(&self, entries: &[PoolEntry]) -> Option<usize> {
        let len = entries.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| entries[idx].is_healthy())
    }

    /// Record a server-issued back-off: the account rests for
    /// `seconds + 1` and is skipped by selection until the cooldown expires.
    pub async fn mark_flood_wait(&self, identifier: &str, seconds: u64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(identifier)) {
            entry.status = AccountStatus::Cooldown;
            entry.cooldown_until = Some(now_unix() + seconds as i64 + 1);
            entry.last_error = Some(format!("flood wait {seconds}s"));
            warn!(account = identifier, seconds, "account placed in cooldown");
        }
    }

    /// Exclude an account until the operator re-enables it.
    pub async fn mark_banned(&self, identifier: &str, reason: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(identifier)) {
            entry.status = AccountStatus::Banned;
            entry.last_error = Some(reason.to_string());
            warn!(account = identifier, reason, "account banned");
        }
    }

    pub async fn reenable(&self, identifier: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.matches(identifier)) {
            Some(entry) => {
                entry.status = AccountStatus::Active;
                entry.cooldown_until = None;
                entry.last_error = None;
                info!(account = identifier, "account re-enabled");
                true
            }
            None => false,
        }
    }

    pub async fn record_error(&self, identifier: &str, message: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(identifier)) {
            entry.last_error = Some(message.to_string());
        }
    }

    pub async fn reset_usage(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            entry.usage_count = 0;
        }
    }

    pub async fn stats(&self) -> Vec<AccountStats> {
        let mut entries = self.entries.lock().await;
        let now = now_unix();
        entries
            .iter_mut()
            .map(|entry| {
                entry.refresh_cooldown(now);
                AccountStats {
                    session_name: entry.session_name.clone(),
                    phone: entry.phone.clone(),
                    status: entry.status,
                    cooldown_until: entry.cooldown_until,
                    usage_count: entry.usage_count,
                    last_error: entry.last_error.clone(),
                }
            })
            .collect()
    }

    /// Session names of currently healthy accounts, in rotation order. Used
    /// for the Saved Messages fan-out.
    pub async fn healthy_sessions(&self) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let now = now_unix();
        entries
            .iter_mut()
            .filter_map(|entry| {
                entry.refresh_cooldown(now);
                entry.is_healthy().then(|| entry.session_name.clone())
            })
            .collect()
    }
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new()
    }
}
