//! Lease model and the client-side lease manager.
//!
//! A lease is time-bounded exclusive access to one exporter, granted by the
//! controller against a label filter. The manager talks to the controller
//! over the same framed protocol the exporter uses; only the operations
//! differ.
//!
//! Scoped acquisition goes through [`LeaseManager::with_lease`]: the lease is
//! released when the closure returns, unless its id was handed in from the
//! environment (`BENCHLINK_LEASE`), in which case the outer owner keeps it.

use crate::client::check_status;
use crate::error::{BenchError, BenchResult};
use crate::protocol::Operation;
use crate::transport::{Connection, ConnectionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};
use uuid::Uuid;

/// Environment variable carrying a pre-acquired lease id. A lease named here
/// is owned by the spawning process and is never auto-released.
pub const LEASE_ENV: &str = "BENCHLINK_LEASE";

/// Extra headroom on the RPC deadline so a controller-side acquire timeout
/// surfaces as a typed response instead of a local timeout.
const RPC_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Pending,
    Active,
    Released,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub client_id: String,
    /// Optional human-readable tag supplied at request time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub filter: HashMap<String, String>,
    /// Name of the matched exporter, once Active.
    pub exporter: Option<String>,
    /// Dialable endpoint of the matched exporter, once Active.
    pub endpoint: Option<String>,
    pub state: LeaseState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active
    }
}

/// Payload of a `LeaseRequest`. The request identity carries the client id.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequestBody {
    pub filter: HashMap<String, String>,
    /// Optional human-readable tag recorded on the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of a `LeaseRelease`. `lease: None` releases every lease the
/// client holds.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseReleaseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Uuid>,
}

/// Per-lease result of a release-all. One failed release never blocks the
/// others, so the outcomes are reported individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReleaseOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Client handle on the controller's lease surface.
pub struct LeaseManager {
    handle: ConnectionHandle,
    client_id: String,
    acquire_timeout: Duration,
}

impl LeaseManager {
    /// Attach to an established controller channel under the given client
    /// identity.
    pub fn connect<C>(channel: C, client_id: impl Into<String>) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            handle: Connection::spawn(channel),
            client_id: client_id.into(),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Bound how long `request_lease` may wait for a match before it gives
    /// up. Only meaningful when the controller runs the wait policy.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn conn(&self) -> &Connection {
        &self.handle.conn
    }

    /// Request exclusive access to an exporter matching `filter`.
    pub async fn request_lease(
        &self,
        filter: HashMap<String, String>,
        name: Option<&str>,
    ) -> BenchResult<Lease> {
        let body = LeaseRequestBody {
            filter,
            name: name.map(str::to_string),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BenchError::Protocol(format!("failed to encode lease request: {e}")))?;

        let response = self
            .conn()
            .request(
                Operation::LeaseRequest,
                self.client_id.clone(),
                payload,
                Some(self.acquire_timeout + RPC_MARGIN),
            )
            .await?;
        let payload = check_status(response, "", "lease")?;
        let lease: Lease = serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed lease: {e}")))?;
        info!(lease = %lease.id, state = ?lease.state, exporter = ?lease.exporter, "lease granted");
        Ok(lease)
    }

    /// Leases held by this client identity, in every state the controller
    /// still tracks.
    pub async fn list_leases(&self) -> BenchResult<Vec<Lease>> {
        let response = self
            .conn()
            .request(
                Operation::LeaseList,
                self.client_id.clone(),
                Vec::new(),
                None,
            )
            .await?;
        let payload = check_status(response, "", "lease")?;
        serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed lease list: {e}")))
    }

    /// Release one lease by id.
    pub async fn release_lease(&self, id: Uuid) -> BenchResult<()> {
        let body = LeaseReleaseBody { lease: Some(id) };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BenchError::Protocol(format!("failed to encode release: {e}")))?;

        let response = self
            .conn()
            .request(
                Operation::LeaseRelease,
                self.client_id.clone(),
                payload,
                None,
            )
            .await?;
        check_status(response, "", "lease")?;
        info!(lease = %id, "lease released");
        Ok(())
    }

    /// Release every lease this client holds. Releases are independent; the
    /// per-lease outcomes are returned instead of a single error.
    pub async fn release_all(&self) -> BenchResult<Vec<ReleaseOutcome>> {
        let body = LeaseReleaseBody { lease: None };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BenchError::Protocol(format!("failed to encode release: {e}")))?;

        let response = self
            .conn()
            .request(
                Operation::LeaseRelease,
                self.client_id.clone(),
                payload,
                None,
            )
            .await?;
        let payload = check_status(response, "", "lease")?;
        serde_json::from_slice(&payload)
            .map_err(|e| BenchError::Protocol(format!("malformed release outcomes: {e}")))
    }

    /// The lease id handed down by the environment, if any.
    pub fn env_lease() -> Option<Uuid> {
        let raw = std::env::var(LEASE_ENV).ok()?;
        match Uuid::parse_str(raw.trim()) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = %raw, "ignoring malformed {LEASE_ENV}");
                None
            }
        }
    }

    /// Run `body` under a lease matching `filter`.
    ///
    /// When `BENCHLINK_LEASE` names a lease this client holds, that lease is
    /// used and NOT released afterwards; it belongs to whoever exported the
    /// variable. Otherwise a fresh lease is acquired and released when `body`
    /// returns, whether it succeeded or not.
    pub async fn with_lease<F, Fut, T>(
        &self,
        filter: HashMap<String, String>,
        body: F,
    ) -> BenchResult<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = BenchResult<T>>,
    {
        let (lease, external) = match Self::env_lease() {
            Some(id) => {
                let lease = self
                    .list_leases()
                    .await?
                    .into_iter()
                    .find(|l| l.id == id && l.is_active())
                    .ok_or_else(|| BenchError::LeaseNotFound(id.to_string()))?;
                info!(lease = %id, "reusing externally held lease");
                (lease, true)
            }
            None => (self.request_lease(filter, None).await?, false),
        };

        let id = lease.id;
        let result = body(lease).await;

        if !external {
            if let Err(e) = self.release_lease(id).await {
                warn!(lease = %id, error = %e, "auto-release failed");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
        result
    }

    /// Drop the controller connection, cancelling in-flight requests.
    pub async fn close(self) {
        self.handle.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_serializes_roundtrip() {
        let lease = Lease {
            id: Uuid::new_v4(),
            client_id: "ci-runner".to_string(),
            name: Some("smoke".to_string()),
            filter: HashMap::from([("board".to_string(), "rpi4".to_string())]),
            exporter: Some("bench-3".to_string()),
            endpoint: Some("10.0.0.3:8787".to_string()),
            state: LeaseState::Active,
            created_at: Utc::now(),
            expires_at: Some(Utc::now()),
        };

        let json = serde_json::to_vec(&lease).unwrap();
        let back: Lease = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.id, lease.id);
        assert_eq!(back.state, LeaseState::Active);
        assert_eq!(back.exporter.as_deref(), Some("bench-3"));
    }

    #[test]
    fn release_body_none_means_all() {
        let body = LeaseReleaseBody { lease: None };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, "{}");

        let back: LeaseReleaseBody = serde_json::from_str("{}").unwrap();
        assert!(back.lease.is_none());
    }

    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&LeaseState::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&LeaseState::Expired).unwrap(),
            "\"expired\""
        );
    }
}
