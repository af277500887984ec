use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flightcache::{CacheConfig, SingleFlightCache};
use reqwest::{StatusCode, Url};
use thiserror::Error;

pub use crate::types::{User, UserId};

/// The default timeout of a single request to the users service.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An error looking up a [`User`].
///
/// Errors are shared between all callers that waited on the same lookup, so they only carry
/// owned, cloneable details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    /// The users service does not know this user.
    #[error("user {0} not found")]
    NotFound(UserId),
    /// The users service responded with an unexpected status code.
    #[error("users service responded with status {0}")]
    Status(u16),
    /// The request did not complete in time.
    #[error("users service timed out after {0:?}")]
    Timeout(Duration),
    /// The users service could not be reached, e.g. due to connection loss or DNS resolution.
    #[error("failed to reach users service: {0}")]
    Transport(String),
    /// The users service responded, but not with the requested user.
    #[error("malformed user response: {0}")]
    Malformed(String),
}

/// Where the [`UserDirectory`] gets its users from.
#[async_trait]
pub trait UserSource: Send + Sync + 'static {
    /// Fetches the user with the given `id`.
    async fn fetch_user(&self, id: UserId) -> Result<User, UserError>;
}

/// A [`UserSource`] requesting `{base_url}/v1/users/{id}` from a users service.
#[derive(Clone, Debug)]
pub struct HttpUserSource {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpUserSource {
    /// Creates a source for the users service at `base_url`.
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Creates a source that uses the given, preconfigured `client`.
    pub fn with_client(client: reqwest::Client, mut base_url: Url) -> Self {
        // `Url::join` replaces the last path segment unless it ends with a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            client,
            base_url,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the timeout for each request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn user_url(&self, id: UserId) -> Result<Url, UserError> {
        self.base_url
            .join(&format!("v1/users/{id}"))
            .map_err(|err| UserError::Transport(err.to_string()))
    }
}

#[async_trait]
impl UserSource for HttpUserSource {
    async fn fetch_user(&self, id: UserId) -> Result<User, UserError> {
        let url = self.user_url(id)?;
        tracing::debug!("Fetching user from {}", url);

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    UserError::Timeout(self.timeout)
                } else {
                    UserError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UserError::NotFound(id));
        }
        if !status.is_success() {
            return Err(UserError::Status(status.as_u16()));
        }

        let user: User = response
            .json()
            .await
            .map_err(|err| UserError::Malformed(err.to_string()))?;
        if user.user_id != id {
            return Err(UserError::Malformed(format!(
                "requested user {id}, got user {}",
                user.user_id
            )));
        }

        Ok(user)
    }
}

/// Looks up users by id, sharing lookups through a [`SingleFlightCache`].
///
/// Concurrent lookups of the same user result in a single request to the [`UserSource`].
/// Found users are kept according to the cache config, failed lookups are retried by the next
/// call.
pub struct UserDirectory {
    source: Arc<dyn UserSource>,
    cache: SingleFlightCache<UserId, Arc<User>, UserError>,
}

impl fmt::Debug for UserDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDirectory")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl UserDirectory {
    /// Creates a new directory on top of `source`.
    pub fn new(source: impl UserSource, config: CacheConfig) -> Self {
        Self {
            source: Arc::new(source),
            cache: SingleFlightCache::new(config),
        }
    }

    /// Returns the user with the given `id`.
    pub async fn get_user_by_id(&self, id: UserId) -> Result<Arc<User>, UserError> {
        let source = Arc::clone(&self.source);
        self.cache
            .get(id, move |id| async move {
                match source.fetch_user(id).await {
                    Ok(user) => Ok(Arc::new(user)),
                    Err(err) => {
                        tracing::debug!(
                            user_id = id,
                            error = &err as &dyn std::error::Error,
                            "Failed to fetch user"
                        );
                        Err(err)
                    }
                }
            })
            .await
    }

    /// Looks up all `ids` concurrently.
    ///
    /// The results are in the same order as `ids`. Duplicate ids are only fetched once.
    pub async fn list_users(&self, ids: &[UserId]) -> Vec<Result<Arc<User>, UserError>> {
        futures::future::join_all(ids.iter().map(|id| self.get_user_by_id(*id))).await
    }

    /// Forgets the user with the given `id`, so that it is fetched again on the next lookup.
    pub fn forget(&self, id: UserId) -> bool {
        self.cache.invalidate(&id)
    }

    /// The cache backing this directory.
    pub fn cache(&self) -> &SingleFlightCache<UserId, Arc<User>, UserError> {
        &self.cache
    }
}
