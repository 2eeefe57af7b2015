//! Login sessions for wikid.
//!
//! A session is a small key/value bag addressed by an opaque random token
//! and bounded by an absolute expiry. Every successful lookup pushes the
//! expiry forward by the configured TTL. A background reaper removes
//! sessions that expire without ever being looked up again.
//!
//! Time comes from a [`Clock`] so expiry can be tested without sleeping.

pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod session;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use memory::MemorySessionStore;
pub use session::Session;
pub use token::{RandomTokens, TokenSource};
