//! The controller: fleet inventory, label matching and the lease table.
//!
//! The controller arbitrates exclusive access. It matches lease requests
//! against the exporter fleet by labels, grants at most one active lease per
//! exporter, expires leases past their deadline and re-runs matching for
//! pending waiters whenever capacity frees up.
//!
//! It serves `LeaseRequest`, `LeaseList` and `LeaseRelease` over the same
//! framed protocol as the exporter; device operations are rejected here.

use crate::config::LeaseSettings;
use crate::error::{BenchError, BenchResult};
use crate::lease::{Lease, LeaseReleaseBody, LeaseRequestBody, LeaseState, ReleaseOutcome};
use crate::protocol::{
    read_frame, write_frame, Frame, Operation, Request, Response, Status,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One exporter known to the fleet.
#[derive(Debug, Clone)]
pub struct ExporterEntry {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub endpoint: String,
    pub online: bool,
}

/// Source of fleet membership. The in-memory implementation suffices for a
/// single controller; an external registry plugs in behind this trait.
#[async_trait]
pub trait FleetInventory: Send + Sync {
    async fn list_exporters(&self) -> Vec<ExporterEntry>;
}

#[derive(Default)]
pub struct InMemoryInventory {
    entries: RwLock<HashMap<String, ExporterEntry>>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, entry: ExporterEntry) {
        self.entries.write().await.insert(entry.name.clone(), entry);
    }

    pub async fn set_online(&self, name: &str, online: bool) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.online = online;
        }
    }
}

#[async_trait]
impl FleetInventory for InMemoryInventory {
    async fn list_exporters(&self) -> Vec<ExporterEntry> {
        self.entries.read().await.values().cloned().collect()
    }
}

/// What a request does when no exporter is free: fail immediately, or wait
/// for capacity within the acquire timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    #[default]
    Fail,
    Wait,
}

impl MatchPolicy {
    pub fn parse(value: &str) -> BenchResult<Self> {
        match value {
            "fail" => Ok(Self::Fail),
            "wait" => Ok(Self::Wait),
            other => Err(BenchError::InvalidRequest(format!(
                "unknown match policy: {other}"
            ))),
        }
    }
}

/// True when every label in `filter` is present in `labels` with an equal
/// value. An empty filter matches everything.
pub fn labels_match(filter: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
}

/// Outcome of one matching attempt for a (possibly parked) lease request.
enum Grant {
    Granted(Lease),
    NoCapacity,
    /// The lease under this id is no longer Pending; the wait must end.
    Terminated(LeaseState),
}

pub struct Controller {
    inventory: Arc<dyn FleetInventory>,
    leases: Mutex<HashMap<Uuid, Lease>>,
    /// Woken on release and expiry so pending waiters re-run matching.
    capacity: Notify,
    policy: MatchPolicy,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl Controller {
    pub fn new(inventory: Arc<dyn FleetInventory>) -> Self {
        Self {
            inventory,
            leases: Mutex::new(HashMap::new()),
            capacity: Notify::new(),
            policy: MatchPolicy::default(),
            ttl: Duration::from_secs(1800),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_settings(
        inventory: Arc<dyn FleetInventory>,
        settings: &LeaseSettings,
    ) -> BenchResult<Self> {
        let mut controller = Self::new(inventory);
        controller.policy = MatchPolicy::parse(&settings.no_match_policy)?;
        controller.ttl = settings.ttl;
        controller.acquire_timeout = settings.acquire_timeout;
        Ok(controller)
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Grant a lease for `filter`, or fail per the configured policy.
    pub async fn request_lease(
        &self,
        client_id: &str,
        filter: HashMap<String, String>,
        name: Option<String>,
    ) -> BenchResult<Lease> {
        self.expire_stale().await;

        let pending_id = Uuid::new_v4();
        if let Grant::Granted(lease) = self.try_grant(pending_id, client_id, &filter, &name).await {
            return Ok(lease);
        }

        if self.policy == MatchPolicy::Fail {
            debug!(client = client_id, ?filter, "no exporter matched, failing");
            return Err(BenchError::NoMatch);
        }

        // Wait policy: park a pending lease and retry whenever capacity is
        // signalled, up to the acquire deadline.
        self.leases.lock().await.insert(
            pending_id,
            Lease {
                id: pending_id,
                client_id: client_id.to_string(),
                name: name.clone(),
                filter: filter.clone(),
                exporter: None,
                endpoint: None,
                state: LeaseState::Pending,
                created_at: Utc::now(),
                expires_at: None,
            },
        );
        info!(lease = %pending_id, client = client_id, "lease pending, waiting for a match");

        let deadline = tokio::time::Instant::now() + self.acquire_timeout;
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            // Register before re-checking so a wakeup between the check and
            // the await is not lost.
            notified.as_mut().enable();

            match self.try_grant(pending_id, client_id, &filter, &name).await {
                Grant::Granted(lease) => return Ok(lease),
                Grant::Terminated(state) => {
                    info!(lease = %pending_id, client = client_id, ?state, "pending lease ended while waiting");
                    return Err(BenchError::LeaseNotFound(pending_id.to_string()));
                }
                Grant::NoCapacity => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut leases = self.leases.lock().await;
                // Released or expired entries stay on the books; only an
                // abandoned Pending lease is removed.
                match leases.get(&pending_id).map(|l| l.state) {
                    Some(LeaseState::Pending) => {
                        leases.remove(&pending_id);
                    }
                    Some(_) => {
                        return Err(BenchError::LeaseNotFound(pending_id.to_string()));
                    }
                    None => {}
                }
                drop(leases);
                warn!(lease = %pending_id, client = client_id, "acquire timed out");
                return Err(BenchError::TimedOut(self.acquire_timeout));
            }
            self.expire_stale().await;
        }
    }

    /// Try to match the filter against a free online exporter. On success
    /// the lease (under `id`) becomes Active in the table. A lease that is
    /// no longer Pending is never granted; the waiter learns it terminated.
    async fn try_grant(
        &self,
        id: Uuid,
        client_id: &str,
        filter: &HashMap<String, String>,
        name: &Option<String>,
    ) -> Grant {
        let fleet = self.inventory.list_exporters().await;
        let mut leases = self.leases.lock().await;

        // The client may have released the pending lease while its request
        // was parked. A terminal lease must never come back.
        match leases.get(&id).map(|l| l.state) {
            None | Some(LeaseState::Pending) => {}
            Some(state) => return Grant::Terminated(state),
        }

        let busy: Vec<&str> = leases
            .values()
            .filter(|l| l.state == LeaseState::Active)
            .filter_map(|l| l.exporter.as_deref())
            .collect();

        let Some(entry) = fleet
            .iter()
            .filter(|e| e.online && labels_match(filter, &e.labels))
            .find(|e| !busy.contains(&e.name.as_str()))
        else {
            return Grant::NoCapacity;
        };

        let now = Utc::now();
        let lease = Lease {
            id,
            client_id: client_id.to_string(),
            name: name.clone(),
            filter: filter.clone(),
            exporter: Some(entry.name.clone()),
            endpoint: Some(entry.endpoint.clone()),
            state: LeaseState::Active,
            created_at: now,
            expires_at: Some(now + chrono::Duration::from_std(self.ttl).unwrap_or_default()),
        };
        leases.insert(id, lease.clone());
        info!(lease = %id, client = client_id, exporter = %entry.name, "lease active");
        Grant::Granted(lease)
    }

    /// Leases held by `client_id`, in every tracked state.
    pub async fn list_leases(&self, client_id: &str) -> Vec<Lease> {
        self.expire_stale().await;
        self.leases
            .lock()
            .await
            .values()
            .filter(|l| l.client_id == client_id)
            .cloned()
            .collect()
    }

    /// Release one lease. Only the owner may release; releasing a lease that
    /// is already terminal reports LeaseNotFound.
    pub async fn release(&self, client_id: &str, id: Uuid) -> BenchResult<()> {
        let mut leases = self.leases.lock().await;
        let lease = leases
            .get_mut(&id)
            .ok_or_else(|| BenchError::LeaseNotFound(id.to_string()))?;

        if lease.client_id != client_id {
            return Err(BenchError::NotOwned(id.to_string()));
        }
        if matches!(lease.state, LeaseState::Released | LeaseState::Expired) {
            return Err(BenchError::LeaseNotFound(id.to_string()));
        }

        lease.state = LeaseState::Released;
        info!(lease = %id, client = client_id, "lease released");
        drop(leases);
        self.capacity.notify_waiters();
        Ok(())
    }

    /// Release a specific set of leases, independently. One failure never
    /// prevents the remaining releases.
    pub async fn release_many(&self, client_id: &str, ids: &[Uuid]) -> Vec<ReleaseOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let error = self.release(client_id, id).await.err().map(|e| e.to_string());
            outcomes.push(ReleaseOutcome { id, error });
        }
        outcomes
    }

    /// Release everything `client_id` holds that is not already terminal.
    pub async fn release_all(&self, client_id: &str) -> Vec<ReleaseOutcome> {
        let ids: Vec<Uuid> = {
            let leases = self.leases.lock().await;
            leases
                .values()
                .filter(|l| l.client_id == client_id)
                .filter(|l| matches!(l.state, LeaseState::Active | LeaseState::Pending))
                .map(|l| l.id)
                .collect()
        };
        self.release_many(client_id, &ids).await
    }

    /// Flip active leases past their deadline to Expired and wake waiters.
    pub async fn expire_stale(&self) {
        let now = Utc::now();
        let mut expired = 0usize;
        {
            let mut leases = self.leases.lock().await;
            for lease in leases.values_mut() {
                if lease.state == LeaseState::Active
                    && lease.expires_at.is_some_and(|at| at <= now)
                {
                    lease.state = LeaseState::Expired;
                    info!(lease = %lease.id, client = %lease.client_id, "lease expired");
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            self.capacity.notify_waiters();
        }
    }

    /// Serve the lease surface over an established channel until the channel
    /// closes or `shutdown` flips to true.
    pub async fn serve_connection<C>(
        self: Arc<Self>,
        channel: C,
        mut shutdown: watch::Receiver<bool>,
    ) -> BenchResult<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        let (read_half, mut write_half) = tokio::io::split(channel);
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(64);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let mut reader = read_half;
        let result = loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Frame::Request(request)) => {
                        // Lease requests may wait; each gets its own task so
                        // one waiter never blocks the connection.
                        let controller = Arc::clone(&self);
                        let frame_tx = frame_tx.clone();
                        tokio::spawn(async move {
                            let response = controller.handle_request(request).await;
                            let _ = frame_tx.send(Frame::Response(response)).await;
                        });
                    }
                    Ok(Frame::Stream(frame)) => {
                        debug!(stream_id = frame.stream_id, "ignoring stream frame on controller connection");
                    }
                    Ok(Frame::Response(resp)) => {
                        warn!(request_id = resp.request_id, "unexpected response frame from client");
                    }
                    Err(BenchError::ConnectionClosed) => {
                        info!("client disconnected");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, "controller connection failed");
                        break Err(e);
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        drop(frame_tx);
        let _ = writer.await;
        result
    }

    /// Accept loop over a TCP listener with a periodic expiry sweep. Runs
    /// until `shutdown` flips to true.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> BenchResult<()> {
        let mut sweep = tokio::time::interval(Duration::from_secs(30));
        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "controller client connected");
                    let controller = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = controller.serve_connection(stream, shutdown).await {
                            warn!(%peer, error = %e, "controller connection ended with error");
                        }
                    });
                }
                _ = sweep.tick() => {
                    self.expire_stale().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("controller shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        let client_id = request.identity.clone();
        if client_id.is_empty()
            && matches!(
                request.operation,
                Operation::LeaseRequest | Operation::LeaseList | Operation::LeaseRelease
            )
        {
            return Response::error(
                request.request_id,
                Status::InvalidRequest,
                "missing client identity",
            );
        }

        match request.operation {
            Operation::LeaseRequest => {
                let body: LeaseRequestBody = match serde_json::from_slice(&request.payload) {
                    Ok(body) => body,
                    Err(e) => {
                        return Response::error(
                            request.request_id,
                            Status::InvalidRequest,
                            format!("malformed lease request: {e}"),
                        )
                    }
                };
                match self.request_lease(&client_id, body.filter, body.name).await {
                    Ok(lease) => encode_response(request.request_id, &lease),
                    Err(e) => error_response(request.request_id, e),
                }
            }
            Operation::LeaseList => {
                let leases = self.list_leases(&client_id).await;
                encode_response(request.request_id, &leases)
            }
            Operation::LeaseRelease => {
                let body: LeaseReleaseBody = match serde_json::from_slice(&request.payload) {
                    Ok(body) => body,
                    Err(e) => {
                        return Response::error(
                            request.request_id,
                            Status::InvalidRequest,
                            format!("malformed release: {e}"),
                        )
                    }
                };
                match body.lease {
                    Some(id) => match self.release(&client_id, id).await {
                        Ok(()) => Response::ok(request.request_id, Vec::new()),
                        Err(e) => error_response(request.request_id, e),
                    },
                    None => {
                        let outcomes = self.release_all(&client_id).await;
                        encode_response(request.request_id, &outcomes)
                    }
                }
            }
            Operation::Report | Operation::Call | Operation::OpenStream => Response::error(
                request.request_id,
                Status::InvalidRequest,
                "controller only serves lease operations",
            ),
        }
    }
}

fn encode_response<T: serde::Serialize>(request_id: u32, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(payload) => Response::ok(request_id, payload),
        Err(e) => Response::error(
            request_id,
            Status::Internal,
            format!("failed to encode response: {e}"),
        ),
    }
}

fn error_response(request_id: u32, error: BenchError) -> Response {
    let status = match &error {
        BenchError::NoMatch => Status::NoMatch,
        // A wait that ran out of time is still "nothing matched" from the
        // caller's side.
        BenchError::TimedOut(_) => Status::NoMatch,
        BenchError::LeaseNotFound(_) => Status::LeaseNotFound,
        BenchError::NotOwned(_) => Status::NotOwned,
        BenchError::InvalidRequest(_) => Status::InvalidRequest,
        _ => Status::Internal,
    };
    Response::error(request_id, status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, labels: &[(&str, &str)]) -> ExporterEntry {
        ExporterEntry {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            endpoint: format!("{name}:8787"),
            online: true,
        }
    }

    fn filter(labels: &[(&str, &str)]) -> HashMap<String, String> {
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn fleet(entries: Vec<ExporterEntry>) -> Arc<InMemoryInventory> {
        let inventory = Arc::new(InMemoryInventory::new());
        for e in entries {
            inventory.add(e).await;
        }
        inventory
    }

    #[test]
    fn policy_parses_from_settings_strings() {
        assert_eq!(MatchPolicy::parse("fail").unwrap(), MatchPolicy::Fail);
        assert_eq!(MatchPolicy::parse("wait").unwrap(), MatchPolicy::Wait);
        assert!(MatchPolicy::parse("retry").is_err());
    }

    #[tokio::test]
    async fn from_settings_carries_policy_and_timeouts() {
        let settings: LeaseSettings = toml::from_str(
            r#"
            no_match_policy = "wait"
            acquire_timeout = "2s"
            ttl = "5m"
            "#,
        )
        .unwrap();

        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::from_settings(inventory, &settings).unwrap();
        assert_eq!(controller.policy, MatchPolicy::Wait);
        assert_eq!(controller.acquire_timeout, Duration::from_secs(2));
        assert_eq!(controller.ttl, Duration::from_secs(300));
    }

    #[test]
    fn filter_matches_superset_labels() {
        let labels = filter(&[("board", "rpi4"), ("site", "lab-1"), ("ram", "8g")]);
        assert!(labels_match(&filter(&[("board", "rpi4")]), &labels));
        assert!(labels_match(&filter(&[]), &labels));
        assert!(!labels_match(&filter(&[("board", "rpi5")]), &labels));
        assert!(!labels_match(&filter(&[("missing", "x")]), &labels));
    }

    #[tokio::test]
    async fn grants_only_matching_exporter() {
        let inventory = fleet(vec![
            entry("e1", &[("board", "rpi4"), ("site", "lab-1")]),
            entry("e2", &[("board", "rpi5"), ("site", "lab-1")]),
        ])
        .await;
        let controller = Controller::new(inventory);

        let lease = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        assert_eq!(lease.exporter.as_deref(), Some("e1"));
        assert!(lease.is_active());
    }

    #[tokio::test]
    async fn zero_match_fails_and_never_activates() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::new(inventory);

        let err = controller
            .request_lease("ci", filter(&[("board", "imx8")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::NoMatch));
        assert!(controller.list_leases("ci").await.is_empty());
    }

    #[tokio::test]
    async fn busy_exporter_is_exclusive() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::new(inventory);

        let first = controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        let err = controller
            .request_lease("bob", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::NoMatch));

        controller.release("alice", first.id).await.unwrap();
        let second = controller
            .request_lease("bob", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        assert_eq!(second.exporter.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn offline_exporter_never_matches() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        inventory.set_online("e1", false).await;
        let controller = Controller::new(inventory);

        let err = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::NoMatch));
    }

    #[tokio::test]
    async fn wait_policy_grants_on_release() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Arc::new(
            Controller::new(inventory)
                .with_policy(MatchPolicy::Wait)
                .with_acquire_timeout(Duration::from_secs(5)),
        );

        let held = controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_lease("bob", filter(&[("board", "rpi4")]), None)
                    .await
            })
        };

        // Give the waiter time to park as Pending, then free the exporter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = controller.list_leases("bob").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, LeaseState::Pending);

        controller.release("alice", held.id).await.unwrap();
        let granted = waiter.await.unwrap().unwrap();
        assert!(granted.is_active());
        assert_eq!(granted.exporter.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn released_pending_lease_is_never_resurrected() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Arc::new(
            Controller::new(inventory)
                .with_policy(MatchPolicy::Wait)
                .with_acquire_timeout(Duration::from_secs(5)),
        );

        let held = controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .request_lease("bob", filter(&[("board", "rpi4")]), None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = controller.list_leases("bob").await;
        assert_eq!(pending[0].state, LeaseState::Pending);

        // Bob gives up on the pending lease before capacity frees.
        controller.release("bob", pending[0].id).await.unwrap();
        controller.release("alice", held.id).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BenchError::LeaseNotFound(_)));

        // The released lease stays released and the exporter stays free.
        let bob = controller.list_leases("bob").await;
        assert!(bob.iter().all(|l| l.state == LeaseState::Released));
        let next = controller
            .request_lease("carol", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        assert_eq!(next.exporter.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn wait_policy_times_out_without_capacity() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::new(inventory)
            .with_policy(MatchPolicy::Wait)
            .with_acquire_timeout(Duration::from_millis(100));

        let _held = controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        let err = controller
            .request_lease("bob", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::TimedOut(_)));
        // The abandoned pending lease is gone.
        assert!(controller.list_leases("bob").await.is_empty());
    }

    #[tokio::test]
    async fn release_checks_ownership() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::new(inventory);

        let lease = controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let err = controller.release("mallory", lease.id).await.unwrap_err();
        assert!(matches!(err, BenchError::NotOwned(_)));

        let err = controller
            .release("alice", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::LeaseNotFound(_)));

        controller.release("alice", lease.id).await.unwrap();
        // Releasing twice reports the lease as gone.
        let err = controller.release("alice", lease.id).await.unwrap_err();
        assert!(matches!(err, BenchError::LeaseNotFound(_)));
    }

    #[tokio::test]
    async fn release_many_is_independent_per_lease() {
        let inventory = fleet(vec![
            entry("e1", &[("board", "rpi4")]),
            entry("e2", &[("board", "rpi4")]),
        ])
        .await;
        let controller = Controller::new(inventory);

        let a = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        let b = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let bogus = Uuid::new_v4();
        let outcomes = controller.release_many("ci", &[a.id, bogus, b.id]).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_ok());
        assert!(!outcomes[1].is_ok());
        assert!(outcomes[2].is_ok());

        let remaining: Vec<_> = controller
            .list_leases("ci")
            .await
            .into_iter()
            .filter(Lease::is_active)
            .collect();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn active_lease_expires_after_ttl() {
        let inventory = fleet(vec![entry("e1", &[("board", "rpi4")])]).await;
        let controller = Controller::new(inventory).with_ttl(Duration::from_millis(10));

        let lease = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            controller.expire_stale().await;
            let state = controller.list_leases("ci").await[0].state;
            if state == LeaseState::Expired {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "lease never expired");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The expired exporter is free again.
        let next = controller
            .request_lease("ci", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        assert_ne!(next.id, lease.id);
        assert!(next.is_active());
    }

    #[tokio::test]
    async fn list_is_scoped_to_client_identity() {
        let inventory = fleet(vec![
            entry("e1", &[("board", "rpi4")]),
            entry("e2", &[("board", "rpi4")]),
        ])
        .await;
        let controller = Controller::new(inventory);

        controller
            .request_lease("alice", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();
        controller
            .request_lease("bob", filter(&[("board", "rpi4")]), None)
            .await
            .unwrap();

        let alice = controller.list_leases("alice").await;
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].client_id, "alice");
    }
}
