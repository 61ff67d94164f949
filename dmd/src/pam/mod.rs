//! Non-blocking authentication on top of the host PAM stack.
//!
//! `ffi` and `session` are the unsafe FFI boundary (conversation callback,
//! transaction handle); `converse` is the trait the callback dispatches
//! into; `authenticator` is the worker-thread/channel pair the rest of the
//! daemon actually talks to.

pub mod authenticator;
pub mod converse;
mod ffi;
mod session;

#[cfg(feature = "fake-auth")]
pub mod fake;

pub use authenticator::{AuthBackend, AuthEvent, AuthOutcome, Authenticator, Message, MessageBatch};
#[cfg(feature = "fake-auth")]
pub use fake::FakeAuthenticator;
