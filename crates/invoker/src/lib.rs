//! Process invoker: the primitive that spawns a lambda's command with a
//! request-shaped stdio and environment.
//!
//! Every invocation forks a child in its own process group, pipes the
//! request body into stdin, streams stdout back to the caller, and tears the
//! whole group down with SIGTERM on cancellation, deadline or parent death.

pub mod credentials;
mod run;

pub use credentials::Credential;
pub use run::{invoke, InvokeSpec};
