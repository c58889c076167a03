use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FirestoreResult;

/// Source of authentication tokens for the streams.
///
/// The engine fetches a token before opening any stream and invalidates the
/// cached one whenever the backend answers with an authentication error, so
/// the next attempt re-authenticates.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
