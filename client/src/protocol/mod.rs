//! Wire types exchanged with the tunnel service.
//!
//! - [`AllocationResponse`] - JSON body returned by the allocation endpoint
//! - [`ControlFrame`] - out-of-band text frames received on transport channels
//!
//! Also provides a type-safe wrapper for the tunnel identifier.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
