use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use log::info;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};

/// A short-lived access token paired with the long-lived refresh token
/// that can replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The refresh token was rejected, which forces a logout
    #[error("Refresh token is invalid")]
    InvalidRefreshToken,
    #[error("Credential renewal failed: {0}")]
    Renewal(String),
    #[error("No credential is available")]
    Missing,
}

/// The external auth service that exchanges a refresh token for a new
/// credential pair.
#[async_trait]
pub trait AuthApi: Send + Sync + 'static {
    async fn renew(&self, refresh_token: &str) -> Result<Credential, AuthError>;
}

/// Owns the credential pair of one session.
///
/// Renewal is single-flight: concurrent triggers share the in-flight
/// attempt instead of racing the refresh token, which the auth service
/// would treat as reuse and invalidate. Installing a credential from
/// anywhere bumps a generation observable through [CredentialStore::changes],
/// so a session can reconnect proactively when a renewal happens outside
/// its own connect path.
pub struct CredentialStore<A> {
    api: Arc<A>,
    current: Mutex<Option<Credential>>,
    generation: AtomicCell<u64>,
    renewal: AsyncMutex<()>,
    notify: watch::Sender<u64>,
}

impl<A> CredentialStore<A>
where
    A: AuthApi,
{
    pub fn new(api: Arc<A>, initial: Credential) -> Self {
        let (notify, _) = watch::channel(0);

        Self {
            api,
            notify,
            current: Mutex::new(Some(initial)),
            generation: AtomicCell::new(0),
            renewal: AsyncMutex::new(()),
        }
    }

    /// The current credential, if the store has not been cleared.
    pub fn current(&self) -> Option<Credential> {
        self.current.lock().clone()
    }

    /// Watches for credential installations. The value is the generation
    /// at the time of the change and only ever grows.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Installs a credential renewed by an unrelated code path.
    pub fn install(&self, credential: Credential) {
        *self.current.lock() = Some(credential);
        let generation = self.generation.fetch_add(1) + 1;

        self.notify.send_replace(generation);
    }

    /// Removes the credential pair entirely, the equivalent of a forced
    /// logout.
    pub fn clear(&self) {
        *self.current.lock() = None;
        let generation = self.generation.fetch_add(1) + 1;

        self.notify.send_replace(generation);
    }

    /// Renews the credential pair, sharing any renewal already in flight.
    ///
    /// On failure the store is cleared, since a credential that can no
    /// longer be renewed is not worth holding on to.
    pub async fn renew(&self) -> Result<Credential, AuthError> {
        let generation_before = self.generation.load();
        let _guard = self.renewal.lock().await;

        // Another caller renewed while we waited for the guard
        if self.generation.load() != generation_before {
            return self.current().ok_or(AuthError::Missing);
        }

        let refresh_token = self
            .current()
            .ok_or(AuthError::Missing)?
            .refresh_token;

        match self.api.renew(&refresh_token).await {
            Ok(credential) => {
                info!("Credential renewed");
                self.install(credential.clone());

                Ok(credential)
            }
            Err(error) => {
                self.clear();
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    pub struct CountingAuthApi {
        pub calls: AtomicCell<u32>,
        pub fail: bool,
    }

    impl CountingAuthApi {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicCell::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl AuthApi for CountingAuthApi {
        async fn renew(&self, _refresh_token: &str) -> Result<Credential, AuthError> {
            self.calls.fetch_add(1);
            sleep(Duration::from_millis(50)).await;

            if self.fail {
                return Err(AuthError::InvalidRefreshToken);
            }

            Ok(Credential {
                access_token: "renewed-access".to_string(),
                refresh_token: "renewed-refresh".to_string(),
            })
        }
    }

    fn initial() -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
        }
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_renewal() {
        let api = CountingAuthApi::new(false);
        let store = Arc::new(CredentialStore::new(api.clone(), initial()));

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.renew().await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            async move { store.renew().await }
        });

        let first = first.await.expect("task completes").expect("renews");
        let second = second.await.expect("task completes").expect("renews");

        assert_eq!(api.calls.load(), 1);
        assert_eq!(first, second);
        assert_eq!(first.access_token, "renewed-access");
    }

    #[tokio::test]
    async fn failed_renewal_clears_the_store() {
        let api = CountingAuthApi::new(true);
        let store = CredentialStore::new(api, initial());

        let result = store.renew().await;

        assert!(matches!(result, Err(AuthError::InvalidRefreshToken)));
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn installs_are_observable() {
        let api = CountingAuthApi::new(false);
        let store = CredentialStore::new(api, initial());

        let mut changes = store.changes();

        store.install(Credential {
            access_token: "external-access".to_string(),
            refresh_token: "external-refresh".to_string(),
        });

        changes.changed().await.expect("store is alive");
        assert_eq!(
            store.current().expect("credential exists").access_token,
            "external-access"
        );
    }
}
