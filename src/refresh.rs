//! Single-flight coordination of access-token refreshes.
//!
//! The first request to hit `401` while a refresh token is configured becomes
//! the leader and performs the refresh call. Requests that hit `401` while that
//! call is outstanding queue a continuation and wait; when the refresh settles
//! every continuation is released in FIFO order with either the new access
//! token or the refresh error.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Body returned by the refresh (and login) endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Notified after the client rotates its tokens, e.g. to persist them.
pub trait TokenRefreshListener: Send + Sync {
    fn on_tokens_refreshed(&self, tokens: &TokenPair);

    fn on_refresh_failed(&self, _error: &Error) {}
}

/// Credentials the pipeline attaches to outgoing requests.
#[derive(Debug, Default)]
pub(crate) struct Credentials {
    access_token: Mutex<Option<String>>,
    refresh_token: Mutex<Option<String>>,
    api_key: Option<String>,
}

impl Credentials {
    pub(crate) fn new(
        access_token: Option<String>,
        refresh_token: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            access_token: Mutex::new(access_token),
            refresh_token: Mutex::new(refresh_token),
            api_key,
        }
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        lock_unpoisoned(&self.access_token).clone()
    }

    pub(crate) fn set_access_token(&self, access_token: Option<String>) {
        *lock_unpoisoned(&self.access_token) = access_token;
    }

    pub(crate) fn refresh_token(&self) -> Option<String> {
        lock_unpoisoned(&self.refresh_token).clone()
    }

    pub(crate) fn set_refresh_token(&self, refresh_token: Option<String>) {
        *lock_unpoisoned(&self.refresh_token) = refresh_token;
    }

    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Installs a refreshed pair; a missing refresh token keeps the old one.
    pub(crate) fn install(&self, tokens: &TokenPair) {
        self.set_access_token(Some(tokens.access_token.clone()));
        if let Some(refresh_token) = &tokens.refresh_token {
            self.set_refresh_token(Some(refresh_token.clone()));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

type Continuation = oneshot::Sender<Result<String, Error>>;

#[derive(Debug)]
struct RefreshSession {
    state: RefreshState,
    waiters: Vec<Continuation>,
}

/// Role handed to a request that observed a `401`.
pub(crate) enum RefreshRole {
    /// Perform the refresh call with this refresh token, then settle the guard.
    Leader {
        refresh_token: String,
        guard: RefreshGuard,
    },
    /// Wait for the in-flight refresh to settle.
    Waiter(oneshot::Receiver<Result<String, Error>>),
    /// No refresh token is configured; the `401` must surface.
    Unavailable,
}

#[derive(Clone)]
pub(crate) struct TokenRefreshCoordinator {
    session: Arc<Mutex<RefreshSession>>,
    credentials: Arc<Credentials>,
    listener: Option<Arc<dyn TokenRefreshListener>>,
}

impl TokenRefreshCoordinator {
    pub(crate) fn new(
        credentials: Arc<Credentials>,
        listener: Option<Arc<dyn TokenRefreshListener>>,
    ) -> Self {
        Self {
            session: Arc::new(Mutex::new(RefreshSession {
                state: RefreshState::Idle,
                waiters: Vec::new(),
            })),
            credentials,
            listener,
        }
    }

    pub(crate) fn state(&self) -> RefreshState {
        lock_unpoisoned(&self.session).state
    }

    pub(crate) fn queued(&self) -> usize {
        lock_unpoisoned(&self.session).waiters.len()
    }

    /// Checks and flips the session state in one critical section.
    pub(crate) fn begin(&self) -> RefreshRole {
        let mut session = lock_unpoisoned(&self.session);
        match session.state {
            RefreshState::Refreshing => {
                let (sender, receiver) = oneshot::channel();
                session.waiters.push(sender);
                debug!(queued = session.waiters.len(), "queued request behind token refresh");
                RefreshRole::Waiter(receiver)
            }
            RefreshState::Idle => match self.credentials.refresh_token() {
                Some(refresh_token) => {
                    session.state = RefreshState::Refreshing;
                    info!("access token rejected; refreshing");
                    RefreshRole::Leader {
                        refresh_token,
                        guard: RefreshGuard {
                            coordinator: Some(self.clone()),
                        },
                    }
                }
                None => RefreshRole::Unavailable,
            },
        }
    }

    fn settle(&self, outcome: Result<TokenPair, Error>) -> Result<String, Error> {
        let waiters = {
            let mut session = lock_unpoisoned(&self.session);
            session.state = RefreshState::Idle;
            std::mem::take(&mut session.waiters)
        };

        let released = match outcome {
            Ok(tokens) => {
                self.credentials.install(&tokens);
                info!(released = waiters.len(), "token refresh succeeded");
                if let Some(listener) = &self.listener {
                    listener.on_tokens_refreshed(&tokens);
                }
                Ok(tokens.access_token)
            }
            Err(error) => {
                self.credentials.set_refresh_token(None);
                warn!(
                    status = error.status(),
                    released = waiters.len(),
                    error = %error,
                    "token refresh failed; refresh token cleared"
                );
                if let Some(listener) = &self.listener {
                    listener.on_refresh_failed(&error);
                }
                Err(error)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(released.clone());
        }
        released
    }
}

/// Held by the leader while its refresh call is outstanding.
///
/// Dropping the guard without settling (the leader's future was cancelled)
/// settles the session with an error so queued requests are not stranded.
pub(crate) struct RefreshGuard {
    coordinator: Option<TokenRefreshCoordinator>,
}

impl RefreshGuard {
    pub(crate) fn settle(mut self, outcome: Result<TokenPair, Error>) -> Result<String, Error> {
        match self.coordinator.take() {
            Some(coordinator) => coordinator.settle(outcome),
            None => outcome.map(|tokens| tokens.access_token),
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.settle(Err(Error::refresh_cancelled()));
        }
    }
}

/// Awaits the outcome of a refresh led by another request.
pub(crate) async fn wait_for_refresh(
    receiver: oneshot::Receiver<Result<String, Error>>,
) -> Result<String, Error> {
    receiver
        .await
        .unwrap_or_else(|_| Err(Error::refresh_cancelled()))
}
