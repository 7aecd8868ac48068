//! TLS for client-facing listeners.

pub mod server;

pub use server::{ClientAuth, TlsServerAcceptor};
