//! Network layer: listeners, wire framing and connections.
//!
//! - [`acceptor`]: binds listeners and admits connections
//! - [`codec`]: request header parsing and response framing
//! - [`connection`]: the shared per-connection state
//! - [`stream`]: plain or TLS client streams

pub mod acceptor;
pub mod codec;
pub mod connection;
pub mod stream;

pub use acceptor::{IngressServer, ListenerInfo};
pub use codec::{OutboundFrame, RequestHeader};
pub use connection::{Connection, ConnectionInfo, ConnectionInput, ConnectionRegistry};
pub use stream::ClientStream;
