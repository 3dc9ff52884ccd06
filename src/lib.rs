//! # benchlink
//!
//! Remote access to hardware test benches. An exporter publishes a tree of
//! driver-backed devices; clients discover the tree, call device methods and
//! tunnel byte streams over a single multiplexed connection; a controller
//! arbitrates exclusive, time-bounded access to exporters through leases.
//!
//! ## Crate Structure
//!
//! - **`driver`**: The `Driver` trait, device metadata and the exported
//!   device tree (`DriverNode`), plus subprocess lifecycle helpers.
//! - **`capability`**: Built-in capability implementations (composite,
//!   power, serial) and the registry wiring for their client proxies.
//! - **`report`**: Flattened discovery reports, parent records before child
//!   records.
//! - **`registry`**: The capability registry mapping tags to proxy
//!   factories, and the `CallStub` transport seam.
//! - **`protocol`**: The framed wire protocol shared by exporter, client and
//!   controller.
//! - **`router`**: Stream multiplexing over one connection, with per-stream
//!   buffering and tunnel helpers.
//! - **`exporter`**: The serving side: per-connection RPC loop and the
//!   session owning a driver tree for a bounded scope.
//! - **`client`**: The consuming side: connection plumbing, discovery sync
//!   and proxy tree reconstruction.
//! - **`lease`**: Lease model and the client-side lease manager.
//! - **`controller`**: Fleet inventory, label matching and the lease table.
//! - **`config`**: TOML-backed settings for exporters, clients and the
//!   controller. See `config::Settings`.
//! - **`error`**: The `BenchError` enum used across the crate.
//! - **`logging`**: Structured logging setup.

pub mod capability;
pub mod client;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod exporter;
pub mod lease;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod router;
mod transport;

pub use client::Client;
pub use controller::Controller;
pub use driver::{Driver, DriverNode, Metadata};
pub use error::{BenchError, BenchResult};
pub use exporter::Session;
pub use lease::LeaseManager;
pub use registry::CapabilityRegistry;
