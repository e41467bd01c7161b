//! CI tunnel client library.
//!
//! Exposes a locally running server through a remote tunnel service:
//! allocates a tunnel, opens a pool of WebSocket transport channels, serves
//! an HTTP/2 session across them and forwards every virtual request to the
//! local server.
//!
//! ```no_run
//! use ci_tunnel::{Tunnel, TunnelEvent, TunnelOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let options = TunnelOptions::new(3000, "tunnel.example.com").with_token("secret");
//! let (tunnel, mut events) = Tunnel::new(options)?;
//! let info = tunnel.open().await?;
//! println!("{}", info.url);
//!
//! while let Some(event) = events.recv().await {
//!     if let TunnelEvent::Close = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::{Tunnel, TunnelEvent, TunnelInfo, TunnelOptions};
pub use error::{Result, TunnelError};
