//! Authentication: connection-bound tokens and the per-connection gate.

mod gate;
mod token;

pub use gate::{AuthGate, AuthState};
pub use token::AuthToken;
