//! Versioned IP-set client for the firewall's blocklist resource.
//!
//! The resource is shared by concurrent writers (real-time path, sweeper,
//! re-analyzer, other process instances), so every mutation is a
//! read-modify-write guarded by an optimistic version token: fetch the
//! membership with its token, submit the replacement with that token, and
//! treat a stale token as a retryable conflict. No in-process lock exists;
//! the token is the sole concurrency-control mechanism.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration as TokioDuration};

use crate::errors::AppError;

/// Snapshot of an IP set at a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpSetView {
    pub members: Vec<String>,
    pub version: String,
}

/// Bounded attempts for one read-modify-write cycle.
pub const MAX_RMW_ATTEMPTS: u32 = 4;

/// Exponential backoff schedule for RMW retries (100ms base, doubling).
pub fn backoff_delay(attempt: u32) -> TokioDuration {
    TokioDuration::from_millis(100u64 << attempt.min(6))
}

/// Backend for the external IP-set resource.
#[derive(Debug, Clone)]
pub enum IpSetBackend {
    Http(HttpIpSet),
    Memory(MemoryIpSet),
}

impl IpSetBackend {
    pub async fn fetch(&self, name: &str) -> Result<IpSetView, AppError> {
        match self {
            Self::Http(backend) => backend.fetch(name).await,
            Self::Memory(backend) => backend.fetch(name),
        }
    }

    /// Replace the membership, conditional on `version` still being current.
    /// Returns the new version token; `AppError::Conflict` on a stale token.
    pub async fn replace(
        &self,
        name: &str,
        members: &[String],
        version: &str,
    ) -> Result<String, AppError> {
        match self {
            Self::Http(backend) => backend.replace(name, members, version).await,
            Self::Memory(backend) => backend.replace(name, members, version),
        }
    }

    /// Read-modify-write with bounded retry: fetch, apply `mutate` to the
    /// membership, replace with the fetched token. Retries the whole cycle
    /// on conflict or transient unavailability, with exponential backoff.
    ///
    /// Returns the version token that confirmed the write. A no-op mutation
    /// (membership unchanged) skips the write and returns the fetched token.
    pub async fn mutate<F>(&self, name: &str, mutate: F) -> Result<String, AppError>
    where
        F: Fn(&mut Vec<String>),
    {
        let mut last_err = None;
        for attempt in 0..MAX_RMW_ATTEMPTS {
            if attempt > 0 {
                sleep(backoff_delay(attempt - 1)).await;
            }

            let view = match self.fetch(name).await {
                Ok(view) => view,
                Err(e) if e.is_retryable() => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut members = view.members.clone();
            mutate(&mut members);
            if members == view.members {
                return Ok(view.version);
            }

            match self.replace(name, &members, &view.version).await {
                Ok(version) => return Ok(version),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        ipset = name,
                        attempt,
                        error = %e,
                        "IP set write conflicted, retrying read-modify-write"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::Unavailable("IP set mutation retries exhausted".to_string())
        }))
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// Client for the firewall's IP-set API.
///
/// `GET {base}/ipsets/{name}` returns `{"members": [...], "lock_token": "..."}`;
/// `PUT` with the same shape replaces it, answering 409 on a stale token and
/// 429/5xx when rate-limited or degraded.
#[derive(Debug, Clone)]
pub struct HttpIpSet {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireIpSet {
    members: Vec<String>,
    lock_token: String,
}

impl HttpIpSet {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, name: &str) -> String {
        format!("{}/ipsets/{name}", self.base_url.trim_end_matches('/'))
    }

    async fn fetch(&self, name: &str) -> Result<IpSetView, AppError> {
        let response = self
            .client
            .get(self.url(name))
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("IP set fetch failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let wire: WireIpSet = response.json().await.map_err(|e| {
                    AppError::Internal(format!("Malformed IP set response: {e}"))
                })?;
                Ok(IpSetView {
                    members: wire.members,
                    version: wire.lock_token,
                })
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(AppError::NotFound(format!("IP set not found: {name}")))
            }
            status => Err(AppError::Unavailable(format!(
                "IP set fetch returned {status}"
            ))),
        }
    }

    async fn replace(
        &self,
        name: &str,
        members: &[String],
        version: &str,
    ) -> Result<String, AppError> {
        let body = WireIpSet {
            members: members.to_vec(),
            lock_token: version.to_string(),
        };
        let response = self
            .client
            .put(self.url(name))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("IP set replace failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                let wire: WireIpSet = response.json().await.map_err(|e| {
                    AppError::Internal(format!("Malformed IP set response: {e}"))
                })?;
                Ok(wire.lock_token)
            }
            reqwest::StatusCode::CONFLICT => Err(AppError::Conflict(format!(
                "Stale version token for IP set {name}"
            ))),
            status => Err(AppError::Unavailable(format!(
                "IP set replace returned {status}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend (dev/test)
// ---------------------------------------------------------------------------

/// Versioned in-memory IP sets with the same conflict semantics as the
/// HTTP backend. Used by unit tests and local development.
#[derive(Debug, Clone, Default)]
pub struct MemoryIpSet {
    sets: Arc<Mutex<HashMap<String, (Vec<String>, u64)>>>,
}

impl MemoryIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch(&self, name: &str) -> Result<IpSetView, AppError> {
        let mut sets = self.sets.lock().expect("ipset mutex poisoned");
        let (members, version) = sets.entry(name.to_string()).or_default();
        Ok(IpSetView {
            members: members.clone(),
            version: version.to_string(),
        })
    }

    fn replace(&self, name: &str, members: &[String], version: &str) -> Result<String, AppError> {
        let mut sets = self.sets.lock().expect("ipset mutex poisoned");
        let (current, current_version) = sets.entry(name.to_string()).or_default();
        if current_version.to_string() != version {
            return Err(AppError::Conflict(format!(
                "Stale version token for IP set {name}"
            )));
        }
        *current = members.to_vec();
        *current_version += 1;
        Ok(current_version.to_string())
    }

    /// Current membership, for assertions in tests.
    pub fn members(&self, name: &str) -> Vec<String> {
        self.sets
            .lock()
            .expect("ipset mutex poisoned")
            .get(name)
            .map(|(members, _)| members.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fetch_starts_empty() {
        let backend = IpSetBackend::Memory(MemoryIpSet::new());
        let view = backend.fetch("t1-blocklist").await.unwrap();
        assert!(view.members.is_empty());
        assert_eq!(view.version, "0");
    }

    #[tokio::test]
    async fn replace_with_current_token_succeeds() {
        let backend = IpSetBackend::Memory(MemoryIpSet::new());
        let view = backend.fetch("s").await.unwrap();
        let next = backend
            .replace("s", &["203.0.113.9".to_string()], &view.version)
            .await
            .unwrap();
        assert_eq!(next, "1");
        assert_eq!(backend.fetch("s").await.unwrap().members.len(), 1);
    }

    #[tokio::test]
    async fn replace_with_stale_token_conflicts() {
        let backend = IpSetBackend::Memory(MemoryIpSet::new());
        let view = backend.fetch("s").await.unwrap();
        backend
            .replace("s", &["203.0.113.9".to_string()], &view.version)
            .await
            .unwrap();

        // Second writer using the original token must fail.
        let err = backend
            .replace("s", &["198.51.100.4".to_string()], &view.version)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn mutate_retries_through_conflicts() {
        let memory = MemoryIpSet::new();
        let backend = IpSetBackend::Memory(memory.clone());

        // Two concurrent writers adding different members: both must land.
        let b1 = backend.clone();
        let b2 = backend.clone();
        let (r1, r2) = tokio::join!(
            b1.mutate("s", |members| {
                if !members.contains(&"203.0.113.9".to_string()) {
                    members.push("203.0.113.9".to_string());
                }
            }),
            b2.mutate("s", |members| {
                if !members.contains(&"198.51.100.4".to_string()) {
                    members.push("198.51.100.4".to_string());
                }
            }),
        );
        r1.unwrap();
        r2.unwrap();

        let members = memory.members("s");
        assert!(members.contains(&"203.0.113.9".to_string()));
        assert!(members.contains(&"198.51.100.4".to_string()));
    }

    #[tokio::test]
    async fn mutate_noop_skips_write() {
        let backend = IpSetBackend::Memory(MemoryIpSet::new());
        let before = backend.fetch("s").await.unwrap().version;
        let version = backend.mutate("s", |_| {}).await.unwrap();
        assert_eq!(version, before);
    }

    #[tokio::test]
    async fn mutate_removal() {
        let memory = MemoryIpSet::new();
        let backend = IpSetBackend::Memory(memory.clone());
        backend
            .mutate("s", |members| members.push("203.0.113.9".to_string()))
            .await
            .unwrap();
        backend
            .mutate("s", |members| members.retain(|m| m != "203.0.113.9"))
            .await
            .unwrap();
        assert!(memory.members("s").is_empty());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), TokioDuration::from_millis(100));
        assert_eq!(backoff_delay(1), TokioDuration::from_millis(200));
        assert_eq!(backoff_delay(2), TokioDuration::from_millis(400));
        // Capped so a buggy attempt counter cannot sleep unboundedly.
        assert_eq!(backoff_delay(20), TokioDuration::from_millis(6400));
    }
}
