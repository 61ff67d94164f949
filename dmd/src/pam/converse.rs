//! The handler trait the C conversation callback in `ffi.rs` dispatches
//! into. Implementations never block the event loop: the worker thread in
//! `authenticator.rs` is the only place these methods are called from.

/// Called through a `&self` C callback, so any state an implementation
/// needs (a channel to the worker's caller, a scripted response queue)
/// has to be interior-mutable.
pub trait Converse {
    /// A visible prompt (`PAM_PROMPT_ECHO_ON`), e.g. a username.
    fn prompt_echo(&self, msg: &str) -> Result<String, ()>;
    /// A masked prompt (`PAM_PROMPT_ECHO_OFF`), e.g. a password.
    fn prompt_blind(&self, msg: &str) -> Result<String, ()>;
    fn info(&self, msg: &str) -> Result<(), ()>;
    fn error(&self, msg: &str) -> Result<(), ()>;
}
