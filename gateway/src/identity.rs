//! Identity resolution: `Authorization` bearer credential → stable user id.
//!
//! Runs before the gateway layer and injects `ResolvedIdentity` into request
//! extensions. Strictly best-effort: a missing header, unknown credential or
//! database failure all degrade to network-address identity — admission
//! control never fails because authentication info was unavailable.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::Response;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use sentra_core::auth::{bearer_credential, hash_credential};

/// Authenticated principal resolved for this request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub user_id: Uuid,
}

#[derive(Clone)]
pub struct InjectIdentityLayer {
    pool: sqlx::PgPool,
}

impl InjectIdentityLayer {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

impl<S> Layer<S> for InjectIdentityLayer {
    type Service = InjectIdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InjectIdentityService {
            inner,
            pool: self.pool.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InjectIdentityService<S> {
    inner: S,
    pool: sqlx::PgPool,
}

impl<S> Service<Request> for InjectIdentityService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let pool = self.pool.clone();

        Box::pin(async move {
            let credential = req
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_credential)
                .map(hash_credential);

            if let Some(credential_hash) = credential {
                match lookup_user(&pool, &credential_hash).await {
                    Ok(Some(user_id)) => {
                        req.extensions_mut().insert(ResolvedIdentity { user_id });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "identity resolution failed; falling back to address identity"
                        );
                    }
                }
            }

            ready.oneshot(req).await
        })
    }
}

async fn lookup_user(
    pool: &sqlx::PgPool,
    credential_hash: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT user_id FROM api_credentials \
         WHERE credential_hash = $1 AND revoked_at IS NULL",
    )
    .bind(credential_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(user_id,)| user_id))
}
