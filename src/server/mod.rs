//! Session transport module
//!
//! Frames, parses and routes the debug adapter messages exchanged with the
//! front end over a single TCP connection.

mod codec;
mod protocol;
mod transport;

pub use codec::*;
pub use protocol::*;
pub use transport::*;
