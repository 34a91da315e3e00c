//! Connection plumbing for a MongoDB terminal client: SSH-forwarded tunnels
//! and the connection-string rewriting that points the driver at them.

pub mod services;

pub use services::ssh;
pub use services::{connection_string, connections};
