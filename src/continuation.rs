//! Continuation registry (component G): a process-local, TTL-bounded map
//! from opaque token to a resumable callback, swept in the background.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::sync::Mutex;

use crate::err::{BioIndexError, Result};

const TOKEN_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const TOKEN_BYTES: usize = 20;

/// Invoked with the page number it should resume at; returns the page body
/// (as opaque JSON, since `server::rest` owns the actual response shape)
/// plus whether there is more data to continue.
pub type ContinuationFn = Box<
    dyn FnMut(
            u64,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(serde_json::Value, bool)>> + Send>,
        > + Send,
>;

struct Entry {
    callback: ContinuationFn,
    page: u64,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct ContinuationRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers `callback` under a fresh token, bound to start at `page`.
    pub async fn make_continuation(&self, page: u64, callback: ContinuationFn) -> String {
        let token = generate_token();
        let mut entries = self.entries.lock().await;
        entries.insert(
            token.clone(),
            Entry {
                callback,
                page,
                expires_at: Instant::now() + TOKEN_TTL,
            },
        );
        token
    }

    /// Looks up and removes `token`, invokes its callback for the next
    /// page, and — if there is more data — installs a *new* continuation
    /// for `page + 1`, returning it alongside the page body.
    pub async fn advance(
        &self,
        token: &str,
        next_callback_factory: impl FnOnce(ContinuationFn) -> ContinuationFn,
    ) -> Result<(serde_json::Value, Option<String>)> {
        let mut entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(token).ok_or(BioIndexError::TokenExpired)?
        };

        if entry.expires_at < Instant::now() {
            return Err(BioIndexError::TokenExpired);
        }

        let (body, has_more) = (entry.callback)(entry.page).await?;
        let next_page = entry.page + 1;

        if !has_more {
            return Ok((body, None));
        }

        let wrapped = next_callback_factory(entry.callback);
        let new_token = self.make_continuation(next_page, wrapped).await;
        Ok((body, Some(new_token)))
    }

    pub async fn remove(&self, token: &str) {
        self.entries.lock().await.remove(token);
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at >= now);
    }

    /// Spawns the background sweeper; returns its join handle so callers
    /// can abort it on shutdown.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }
}

impl Default for ContinuationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    let bytes: Vec<u8> = (0..TOKEN_BYTES).map(|_| fastrand::u8(..)).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_token_is_expired() {
        let registry = ContinuationRegistry::new();
        let result = registry
            .advance("nope", |cb| cb)
            .await;
        assert!(matches!(result, Err(BioIndexError::TokenExpired)));
    }

    #[tokio::test]
    async fn advance_chains_to_next_page() {
        let registry = ContinuationRegistry::new();
        let token = registry
            .make_continuation(
                0,
                Box::new(|page| {
                    Box::pin(async move { Ok((serde_json::json!({"page": page}), page < 1)) })
                }),
            )
            .await;

        let (body, next) = registry.advance(&token, |cb| cb).await.unwrap();
        assert_eq!(body["page"], 0);
        assert!(next.is_some());

        let (body, next) = registry.advance(next.as_deref().unwrap(), |cb| cb).await.unwrap();
        assert_eq!(body["page"], 1);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let registry = ContinuationRegistry::new();
        let token = registry
            .make_continuation(
                0,
                Box::new(|page| Box::pin(async move { Ok((serde_json::json!(page), false)) })),
            )
            .await;
        {
            let mut entries = registry.entries.lock().await;
            entries.get_mut(&token).unwrap().expires_at = Instant::now() - Duration::from_secs(1);
        }
        registry.sweep().await;
        assert!(registry.entries.lock().await.is_empty());
    }
}
