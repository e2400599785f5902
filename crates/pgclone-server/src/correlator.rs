//! Correlation of the OAuth redirect flow with the request waiting for its
//! result.
//!
//! A client picks an opaque `state`, opens `/authenticate?state=..` in a
//! browser and at the same time calls `POST /access_tokens` with that state.
//! The second request blocks here until the provider redirects the browser to
//! `/oauth_callback`, which exchanges the code and hands the token over.

use crate::oauth::OAuthClient;
use pgclone_common::AccessToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

pub const OAUTH_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure produced on the callback side and delivered to the waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("OAuth provider returned an error: {0}")]
    Provider(String),

    #[error("OAuth callback response code is empty")]
    MissingCode,

    #[error("token exchange error: {0}")]
    Exchange(String),

    #[error("token exchange timed out after {0:?}")]
    ExchangeTimedOut(Duration),
}

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("a token request for this state is already pending")]
    DuplicateState,

    #[error("no OAuth callback arrived within {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("token request was abandoned before a result was delivered")]
    Abandoned,
}

/// What a callback did with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Delivered,
    NoWaiter,
}

type Delivery = Result<AccessToken, CallbackError>;

struct Slot {
    registration: u64,
    sender: oneshot::Sender<Delivery>,
}

type Registry = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, Slot>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct AuthCorrelator {
    client: Arc<dyn OAuthClient>,
    registry: Registry,
    registrations: Arc<AtomicU64>,
    callback_timeout: Duration,
    exchange_timeout: Duration,
}

impl AuthCorrelator {
    pub fn new(client: Arc<dyn OAuthClient>) -> Self {
        Self::with_timeouts(client, OAUTH_CALLBACK_TIMEOUT, TOKEN_EXCHANGE_TIMEOUT)
    }

    pub fn with_timeouts(
        client: Arc<dyn OAuthClient>,
        callback_timeout: Duration,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            client,
            registry: Arc::new(Mutex::new(HashMap::new())),
            registrations: Arc::new(AtomicU64::new(0)),
            callback_timeout,
            exchange_timeout,
        }
    }

    /// Provider URL the browser should be sent to for `state`.
    pub fn authorize_url(&self, state: &str) -> String {
        self.client.auth_code_url(state)
    }

    /// Register a slot for `state`. The slot lives as long as the returned
    /// [`PendingToken`].
    pub fn register(&self, state: &str) -> Result<PendingToken, CorrelatorError> {
        let (sender, receiver) = oneshot::channel();
        let registration = self.registrations.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = lock(&self.registry);
            if registry.contains_key(state) {
                return Err(CorrelatorError::DuplicateState);
            }
            registry.insert(
                state.to_string(),
                Slot {
                    registration,
                    sender,
                },
            );
        }

        debug!(registration, "Registered token request");
        Ok(PendingToken {
            state: state.to_string(),
            registration,
            receiver,
            registry: self.registry.clone(),
            timeout: self.callback_timeout,
        })
    }

    /// Register `state` and wait for its callback.
    #[instrument(skip_all)]
    pub async fn create(&self, state: &str) -> Result<AccessToken, CorrelatorError> {
        self.register(state)?.wait().await
    }

    /// Handle the provider redirect for `state`.
    ///
    /// Returns `Ok(NoWaiter)` when nobody is waiting for `state`. Errors are
    /// returned to the browser as well as delivered to the waiter.
    #[instrument(skip_all)]
    pub async fn callback(
        &self,
        state: &str,
        code: Option<&str>,
        error: Option<&str>,
    ) -> Result<CallbackOutcome, CallbackError> {
        if !self.is_pending(state) {
            info!("Cannot find pending token request for OAuth callback");
            return Ok(CallbackOutcome::NoWaiter);
        }

        let result = match (error.filter(|e| !e.is_empty()), code.filter(|c| !c.is_empty())) {
            (Some(error), _) => Err(CallbackError::Provider(error.to_string())),
            (None, None) => {
                warn!("Empty OAuth response code");
                Err(CallbackError::MissingCode)
            }
            (None, Some(code)) => self.exchange(code).await,
        };

        let delivered = self.deliver(state, result.clone());
        result.map(|_| delivered)
    }

    pub fn is_pending(&self, state: &str) -> bool {
        lock(&self.registry).contains_key(state)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.registry).len()
    }

    async fn exchange(&self, code: &str) -> Delivery {
        match timeout(self.exchange_timeout, self.client.exchange(code)).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(e)) => Err(CallbackError::Exchange(e.to_string())),
            Err(_) => Err(CallbackError::ExchangeTimedOut(self.exchange_timeout)),
        }
    }

    fn deliver(&self, state: &str, result: Delivery) -> CallbackOutcome {
        // The waiter may have expired while the code was being exchanged.
        let Some(slot) = lock(&self.registry).remove(state) else {
            info!("Token request expired before the callback completed");
            return CallbackOutcome::NoWaiter;
        };

        if slot.sender.send(result).is_err() {
            debug!(registration = slot.registration, "Waiter went away before delivery");
            return CallbackOutcome::NoWaiter;
        }
        CallbackOutcome::Delivered
    }
}

/// A registered slot. Dropping it, waited on or not, removes the slot.
pub struct PendingToken {
    state: String,
    registration: u64,
    receiver: oneshot::Receiver<Delivery>,
    registry: Registry,
    timeout: Duration,
}

impl PendingToken {
    pub async fn wait(mut self) -> Result<AccessToken, CorrelatorError> {
        match timeout(self.timeout, &mut self.receiver).await {
            Ok(Ok(Ok(token))) => Ok(token),
            Ok(Ok(Err(e))) => {
                info!(error = %e, "OAuth request failed");
                Err(e.into())
            }
            Ok(Err(_)) => Err(CorrelatorError::Abandoned),
            Err(_) => {
                info!(after = ?self.timeout, "OAuth callback timed out");
                Err(CorrelatorError::TimedOut(self.timeout))
            }
        }
    }
}

impl Drop for PendingToken {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        // A later registration for the same state owns the entry now.
        if registry
            .get(&self.state)
            .is_some_and(|slot| slot.registration == self.registration)
        {
            registry.remove(&self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{OAuthError, Result as OAuthResult};
    use async_trait::async_trait;

    struct StubProvider {
        hang: bool,
    }

    #[async_trait]
    impl OAuthClient for StubProvider {
        fn auth_code_url(&self, state: &str) -> String {
            format!("https://accounts.example.com/auth?state={state}")
        }

        async fn exchange(&self, code: &str) -> OAuthResult<AccessToken> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if code == "bad" {
                return Err(OAuthError::Provider {
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(token(code))
        }

        async fn refresh(&self, _refresh_token: &str) -> OAuthResult<AccessToken> {
            unimplemented!()
        }

        async fn user_email(&self, _access_token: &str) -> OAuthResult<String> {
            unimplemented!()
        }
    }

    fn token(code: &str) -> AccessToken {
        AccessToken {
            access_token: format!("access-{code}"),
            token_type: "Bearer".to_string(),
            refresh_token: Some(format!("refresh-{code}")),
            expiry: None,
        }
    }

    fn correlator() -> AuthCorrelator {
        AuthCorrelator::new(Arc::new(StubProvider { hang: false }))
    }

    #[test]
    fn authorize_url_comes_from_provider() {
        assert_eq!(
            correlator().authorize_url("xyz"),
            "https://accounts.example.com/auth?state=xyz"
        );
    }

    #[tokio::test]
    async fn callback_result_reaches_waiter_verbatim() {
        let correlator = correlator();
        let pending = correlator.register("s1").unwrap();

        let outcome = correlator.callback("s1", Some("c0de"), None).await.unwrap();
        assert_eq!(outcome, CallbackOutcome::Delivered);

        assert_eq!(pending.wait().await.unwrap(), token("c0de"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn create_blocks_until_callback() {
        let correlator = correlator();
        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.create("s2").await })
        };

        while !correlator.is_pending("s2") {
            tokio::task::yield_now().await;
        }
        correlator.callback("s2", Some("abc"), None).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), token("abc"));
        assert!(!correlator.is_pending("s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn create_times_out_and_frees_slot() {
        let correlator = correlator();

        let err = correlator.create("lonely").await.unwrap_err();
        assert!(matches!(err, CorrelatorError::TimedOut(after) if after == OAUTH_CALLBACK_TIMEOUT));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn callback_for_unknown_state_is_a_no_op() {
        let correlator = correlator();
        let outcome = correlator.callback("nobody", Some("abc"), None).await.unwrap();
        assert_eq!(outcome, CallbackOutcome::NoWaiter);

        let outcome = correlator.callback("nobody", None, Some("access_denied")).await.unwrap();
        assert_eq!(outcome, CallbackOutcome::NoWaiter);
    }

    #[tokio::test]
    async fn provider_error_is_delivered_and_returned() {
        let correlator = correlator();
        let pending = correlator.register("s3").unwrap();

        let err = correlator
            .callback("s3", None, Some("access_denied"))
            .await
            .unwrap_err();
        assert_eq!(err, CallbackError::Provider("access_denied".to_string()));

        let waited = pending.wait().await.unwrap_err();
        assert!(matches!(waited, CorrelatorError::Callback(CallbackError::Provider(_))));
    }

    #[tokio::test]
    async fn empty_code_and_failed_exchange_are_delivered() {
        let correlator = correlator();

        let pending = correlator.register("empty").unwrap();
        assert_eq!(
            correlator.callback("empty", Some(""), None).await.unwrap_err(),
            CallbackError::MissingCode
        );
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            CorrelatorError::Callback(CallbackError::MissingCode)
        ));

        let pending = correlator.register("bad").unwrap();
        assert!(matches!(
            correlator.callback("bad", Some("bad"), None).await.unwrap_err(),
            CallbackError::Exchange(_)
        ));
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            CorrelatorError::Callback(CallbackError::Exchange(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_exchange_times_out() {
        let correlator = AuthCorrelator::new(Arc::new(StubProvider { hang: true }));
        let pending = correlator.register("slow").unwrap();

        let err = correlator.callback("slow", Some("abc"), None).await.unwrap_err();
        assert_eq!(err, CallbackError::ExchangeTimedOut(TOKEN_EXCHANGE_TIMEOUT));
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            CorrelatorError::Callback(CallbackError::ExchangeTimedOut(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_state_is_rejected_and_first_waiter_kept() {
        let correlator = correlator();
        let first = correlator.register("dup").unwrap();

        assert!(matches!(
            correlator.register("dup"),
            Err(CorrelatorError::DuplicateState)
        ));

        correlator.callback("dup", Some("one"), None).await.unwrap();
        assert_eq!(first.wait().await.unwrap(), token("one"));
    }

    #[tokio::test]
    async fn dropped_waiter_frees_slot() {
        let correlator = correlator();
        let pending = correlator.register("gone").unwrap();
        assert!(correlator.is_pending("gone"));

        drop(pending);
        assert!(!correlator.is_pending("gone"));
        assert!(correlator.register("gone").is_ok());
    }

    #[tokio::test]
    async fn cancelled_create_frees_slot() {
        let correlator = correlator();
        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.create("cancel").await })
        };
        while !correlator.is_pending("cancel") {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        let _ = waiter.await;
        assert!(!correlator.is_pending("cancel"));
    }

    #[tokio::test]
    async fn concurrent_states_resolve_independently() {
        let correlator = correlator();
        let a = correlator.register("a").unwrap();
        let b = correlator.register("b").unwrap();

        correlator.callback("b", Some("bee"), None).await.unwrap();
        correlator.callback("a", Some("ay"), None).await.unwrap();

        let (a, b) = tokio::join!(a.wait(), b.wait());
        assert_eq!(a.unwrap(), token("ay"));
        assert_eq!(b.unwrap(), token("bee"));
    }
}
