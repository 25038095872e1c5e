//! HTSP client - connects to a live-TV backend over HTSP.
//!
//! The [`Connection`] owns one TCP stream, runs the read and framing workers
//! and matches replies to requests by sequence number. A
//! [`ConnectionSupervisor`] creates connections lazily, rebuilds them after
//! a fault and feeds channel pushes into a [`ChannelAggregator`].
//!
//! ```no_run
//! use htsp_client::{ConnectionConfig, ConnectionRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), htsp_client::ClientError> {
//! let registry = ConnectionRegistry::new();
//! let supervisor = registry.get_or_create("living-room", || ConnectionConfig {
//!     host: "192.168.1.20".to_string(),
//!     username: "tv".to_string(),
//!     password: "secret".to_string(),
//!     ..Default::default()
//! });
//!
//! for channel in supervisor.get_channels(&CancellationToken::new()).await? {
//!     println!("{} {}", channel.number, channel.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod client;
pub mod supervisor;

pub use channels::ChannelAggregator;
pub use client::{Connection, ConnectionConfig, ConnectionListener, ConnectionState};
pub use supervisor::{ConnectionRegistry, ConnectionSupervisor, SyncState};

pub use htsp_protocol::{ChannelInfo, ChannelType, ClientError, Message, MessageBuilder};
