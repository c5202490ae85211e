//! Rotating pool of GitHub API tokens.
//!
//! Workers never touch token bookkeeping directly: they `acquire` a lease,
//! perform one request and hand the lease back together with the quota the
//! server reported. A token whose quota is spent is parked until its reset
//! instant; callers block until some token becomes available again.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::llm::mask_secret;

/// Reset delay used when the server does not say when quota returns.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

/// Lifecycle state of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Available,
    InUse,
    Exhausted { until: Instant },
}

/// Quota information parsed from a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
}

impl RateLimitSnapshot {
    pub fn new(remaining: Option<u32>, reset_after: Option<Duration>) -> Self {
        Self {
            remaining,
            reset_after,
        }
    }
}

#[derive(Debug)]
struct Slot {
    token: String,
    state: TokenState,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct Shared {
    slots: Mutex<Vec<Slot>>,
    released: Notify,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // The lock is never held across an await or a panic-prone call.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_back(&self, index: usize, state: TokenState, remaining: Option<u32>) {
        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(index) {
                slot.state = state;
                slot.remaining = remaining;
            }
        }
        self.released.notify_waiters();
    }
}

/// Exclusive use of one token for the duration of a request.
///
/// Dropping a lease without releasing it returns the token unchanged.
#[derive(Debug)]
pub struct TokenLease {
    shared: Arc<Shared>,
    index: usize,
    token: String,
    returned: bool,
}

impl TokenLease {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Masked form suitable for logs.
    pub fn masked(&self) -> String {
        mask_secret(&self.token)
    }

    fn finish(mut self, state: TokenState, remaining: Option<u32>) {
        self.returned = true;
        self.shared.put_back(self.index, state, remaining);
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let remaining = self.shared.slots().get(self.index).and_then(|s| s.remaining);
        self.shared
            .put_back(self.index, TokenState::Available, remaining);
    }
}

/// Shared, cloneable pool of credentials.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    shared: Arc<Shared>,
}

impl CredentialPool {
    /// Build a pool from explicit tokens.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyCredentials` when no non-blank token is given.
    pub fn new<I, S>(tokens: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots: Vec<Slot> = tokens
            .into_iter()
            .map(Into::into)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|token| Slot {
                token,
                state: TokenState::Available,
                remaining: None,
            })
            .collect();

        if slots.is_empty() {
            return Err(ConfigError::EmptyCredentials);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(slots),
                released: Notify::new(),
            }),
        })
    }

    /// Load newline-delimited tokens. Blank lines and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Fails with `ConfigError::EmptyCredentialFile` if the file holds no token.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let tokens: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        if tokens.is_empty() {
            return Err(ConfigError::EmptyCredentialFile(path.display().to_string()));
        }
        let pool = Self::new(tokens)?;
        tracing::info!(path = %path.display(), tokens = pool.len(), "Loaded GitHub credentials");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.shared.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of every token, in load order.
    pub fn states(&self) -> Vec<TokenState> {
        self.shared.slots().iter().map(|s| s.state).collect()
    }

    /// Wait for an available token and mark it in use.
    ///
    /// Prefers the token with the most known remaining quota; tokens whose
    /// quota has never been observed count as full.
    pub async fn acquire(&self) -> TokenLease {
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            notified.as_mut().enable();

            let wake_at = {
                let mut slots = self.shared.slots();
                let now = Instant::now();
                for slot in slots.iter_mut() {
                    if let TokenState::Exhausted { until } = slot.state {
                        if until <= now {
                            slot.state = TokenState::Available;
                            slot.remaining = None;
                        }
                    }
                }

                let best = slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.state == TokenState::Available)
                    .max_by_key(|(i, s)| (s.remaining.unwrap_or(u32::MAX), std::cmp::Reverse(*i)))
                    .map(|(i, _)| i);

                if let Some(index) = best {
                    slots[index].state = TokenState::InUse;
                    return TokenLease {
                        shared: self.shared.clone(),
                        index,
                        token: slots[index].token.clone(),
                        returned: false,
                    };
                }

                slots
                    .iter()
                    .filter_map(|s| match s.state {
                        TokenState::Exhausted { until } => Some(until),
                        _ => None,
                    })
                    .min()
            };

            match wake_at {
                Some(until) => {
                    tracing::debug!(
                        wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "All GitHub tokens busy or exhausted, waiting"
                    );
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Return a token with the quota reported by the server.
    ///
    /// A remaining quota of zero parks the token until `reset_after` elapses.
    pub fn release(&self, lease: TokenLease, snapshot: RateLimitSnapshot) {
        match snapshot.remaining {
            Some(0) => {
                let reset_after = snapshot.reset_after.unwrap_or(DEFAULT_RESET_AFTER);
                self.release_exhausted(lease, reset_after);
            }
            Some(remaining) => lease.finish(TokenState::Available, Some(remaining)),
            None => {
                let previous = self
                    .shared
                    .slots()
                    .get(lease.index)
                    .and_then(|s| s.remaining);
                lease.finish(TokenState::Available, previous);
            }
        }
    }

    /// Park a token whose quota is spent.
    pub fn release_exhausted(&self, lease: TokenLease, reset_after: Duration) {
        tracing::debug!(
            token = %lease.masked(),
            reset_secs = reset_after.as_secs(),
            "GitHub token exhausted"
        );
        let until = Instant::now() + reset_after;
        lease.finish(TokenState::Exhausted { until }, Some(0));
    }

    /// Return a token without new quota information (e.g. after a network error).
    pub fn release_unchanged(&self, lease: TokenLease) {
        drop(lease);
    }
}
