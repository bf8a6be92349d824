pub mod charset;
pub mod constants;
pub mod frame;
pub mod packets;
pub mod port;
pub mod transport;

// Reexport the types an embedder needs to wire up a terminal.
pub use port::{BytePort, SerialSettings};
pub use transport::{LinkError, LinkEvent, LinkTiming, Transport};
