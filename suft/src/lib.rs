//! Reliable, connection-oriented, bidirectional byte streams layered
//! directly on UDP datagrams.
//!
//! An [`Endpoint`] owns one UDP socket and multiplexes any number of
//! connections over it, keyed by a 32-bit connection id. A [`Conn`] is a
//! socket-like byte stream: ordered, reliable and rate-limited to the
//! bandwidth configured in [`Params`], with loss recovery driven by
//! selective acknowledgments and a retransmission timer rather than by an
//! adaptive congestion controller.
//!
//! ```no_run
//! # async fn demo() -> Result<(), suft::Error> {
//! let endpoint = suft::Endpoint::new(suft::Params {
//!     bandwidth: 8,
//!     ..Default::default()
//! })
//! .await?;
//!
//! let conn = endpoint.dial("198.51.100.7:9090").await?;
//! conn.write(b"hello\n").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod conn;
mod endpoint;
mod error;
pub mod packet;
mod queue;
mod rtt;
mod sack;
mod stats;

pub use conn::Conn;
pub use endpoint::{Endpoint, Params};
pub use error::Error;
pub use packet::MSS;
pub use stats::ConnStats;
