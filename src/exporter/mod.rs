//! Exporter side: sessions owning a driver tree and the RPC surface served
//! over a connection.

pub mod service;
pub mod session;

pub use service::serve_connection;
pub use session::{LocalServer, Session};
