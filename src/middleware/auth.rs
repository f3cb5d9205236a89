//! API key authentication middleware
//!
//! Resolves the bearer key to a user id and attaches it to the request as an
//! [`AuthenticatedUser`] extension.

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::AppError;

/// User on whose behalf a request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// User id assigned to every request when authentication is disabled
pub const ANONYMOUS_USER: &str = "anonymous";

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    api_keys: Arc<HashMap<String, String>>,
    enabled: bool,
}

impl AuthLayer {
    /// Layer accepting the given `(key, user_id)` pairs
    pub fn new<I, K, U>(api_keys: I) -> Self
    where
        I: IntoIterator<Item = (K, U)>,
        K: Into<String>,
        U: Into<String>,
    {
        Self {
            api_keys: Arc::new(
                api_keys
                    .into_iter()
                    .map(|(key, user)| (key.into(), user.into()))
                    .collect(),
            ),
            enabled: true,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut layer = Self::new(
            config
                .api_keys
                .iter()
                .map(|k| (k.key.clone(), k.user_id.clone())),
        );
        layer.enabled = config.enabled;
        layer
    }

    /// Layer that lets every request through as [`ANONYMOUS_USER`]
    pub fn disabled() -> Self {
        Self {
            api_keys: Arc::new(HashMap::new()),
            enabled: false,
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            api_keys: self.api_keys.clone(),
            enabled: self.enabled,
        }
    }
}

/// Authentication middleware service
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    api_keys: Arc<HashMap<String, String>>,
    enabled: bool,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        // Health checks are unauthenticated
        if request.uri().path() == "/health" {
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        if !self.enabled {
            request.extensions_mut().insert(AuthenticatedUser {
                user_id: ANONYMOUS_USER.to_string(),
            });
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        let api_key = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim().to_string());

        match api_key {
            Some(key) => match self.api_keys.get(&key) {
                Some(user_id) => {
                    request.extensions_mut().insert(AuthenticatedUser {
                        user_id: user_id.clone(),
                    });
                    let future = self.inner.call(request);
                    Box::pin(async move { future.await })
                }
                None => {
                    warn!("Invalid API key provided");
                    Box::pin(async move {
                        Ok(AppError::AuthenticationFailed("Invalid API key".to_string())
                            .into_response())
                    })
                }
            },
            None => {
                warn!("No API key provided");
                Box::pin(async move {
                    Ok(AppError::AuthenticationFailed(
                        "API key required. Provide via Authorization header: 'Bearer YOUR_API_KEY'"
                            .to_string(),
                    )
                    .into_response())
                })
            }
        }
    }
}
