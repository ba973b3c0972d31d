//! Session module
//!
//! One debug adapter session: the controller that owns the listener and the
//! event loop, and the handlers that turn requests into process actions.

mod controller;
mod handlers;
mod state;

pub use controller::*;
pub use handlers::*;
pub use state::*;
