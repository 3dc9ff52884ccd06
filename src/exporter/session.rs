//! Session: scoped ownership of one driver tree.
//!
//! A session owns the root node for a bounded scope and guarantees release:
//! on [`Session::close`] every node is released exactly once, children
//! strictly before their parent, and a failed release never abandons the
//! remaining releases — failures are collected and surfaced together.
//!
//! Two serving modes share the same RPC surface:
//! - [`Session::serve_local`] binds a unix socket for same-host attachment,
//! - [`Session::serve`] runs the service loop over an established remote
//!   channel.
//!
//! Both are cancellable through [`Session::shutdown`]; in-flight connections
//! observe the signal and close instead of being abandoned mid-call.

use crate::driver::DriverNode;
use crate::error::{BenchError, BenchResult};
use crate::exporter::service::serve_connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long [`Session::close`] waits for serving connections to finish
/// their in-flight calls before releasing the drivers.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    root: Arc<DriverNode>,
    shutdown_tx: watch::Sender<bool>,
    /// One connection may hold the tree at a time, local or remote.
    attachments: Arc<AtomicUsize>,
}

impl Session {
    /// Take ownership of a driver tree. Tree invariants are checked here;
    /// a malformed tree never reaches the wire.
    pub fn new(root: DriverNode) -> BenchResult<Self> {
        root.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            root: Arc::new(root),
            shutdown_tx,
            attachments: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Arc<DriverNode> {
        &self.root
    }

    /// Cancel serving. Connections observe the signal, finish their
    /// Closing transition and exit; pending calls are aborted, not hung.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the RPC loop over an already-established remote channel until the
    /// channel closes or the session is cancelled. A session serves one
    /// connection at a time; a second concurrent `serve` is rejected.
    pub async fn serve<C>(&self, channel: C) -> BenchResult<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self
            .attachments
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("rejecting concurrent session connection");
            return Err(BenchError::InvalidRequest(
                "session is already serving a connection".to_string(),
            ));
        }

        let result =
            serve_connection(channel, Arc::clone(&self.root), self.shutdown_tx.subscribe()).await;
        self.attachments.store(0, Ordering::SeqCst);
        result
    }

    /// Bind a local-only endpoint. Any local process connecting to the
    /// returned socket path gets the same RPC surface as a remote client.
    /// One connection may hold the tree at a time; extra concurrent
    /// connections are rejected.
    pub async fn serve_local(&self) -> BenchResult<LocalServer> {
        let dir = std::env::temp_dir().join(format!("benchlink-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("session.sock");
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "local session listening");

        let root = Arc::clone(&self.root);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let active = Arc::clone(&self.attachments);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            if active
                                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                                .is_err()
                            {
                                warn!("rejecting concurrent local session");
                                drop(stream);
                                continue;
                            }

                            let root = Arc::clone(&root);
                            let shutdown = shutdown_tx.subscribe();
                            let active = Arc::clone(&active);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, root, shutdown).await {
                                    warn!(error = %e, "local connection ended with error");
                                }
                                active.store(0, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "local accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(LocalServer { path, dir, task })
    }

    /// Release every node in the tree, children before parents, best effort.
    /// All failures are collected and surfaced as one aggregate error after
    /// every release has been attempted.
    ///
    /// Serving connections observe the shutdown signal and finish their
    /// in-flight calls first; drivers are only released once the last
    /// connection detached (or the drain window ran out).
    pub async fn close(self) -> BenchResult<()> {
        self.shutdown();

        let deadline = tokio::time::Instant::now() + CLOSE_DRAIN_TIMEOUT;
        while self.attachments.load(Ordering::SeqCst) != 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("closing with a connection still attached");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut failures = Vec::new();
        for node in self.root.post_order() {
            if let Err(e) = node.driver.close().await {
                error!(device = %node.uuid(), name = node.name(), error = %e, "release failed");
                failures.push(BenchError::Driver {
                    device: node.uuid().to_string(),
                    method: "close".to_string(),
                    message: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BenchError::Shutdown(failures))
        }
    }
}

/// A running local-attach endpoint. Dropping it stops accepting and removes
/// the socket's temporary directory.
pub struct LocalServer {
    path: PathBuf,
    dir: PathBuf,
    task: JoinHandle<()>,
}

impl LocalServer {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
