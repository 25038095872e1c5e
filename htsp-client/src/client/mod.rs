//! Protocol engine for a single HTSP connection.

pub mod buffer;
pub mod connection;
pub mod pending;

#[cfg(test)]
pub(crate) mod test_server;

pub use buffer::ByteBuffer;
pub use connection::{Connection, ConnectionConfig, ConnectionListener, ConnectionState};
pub use pending::PendingRequests;
