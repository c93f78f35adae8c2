//! Newline-delimited JSON framing over a TCP socket — the Rust
//! equivalent of the `SocketBuffer` + `JsonMachine` pair of `spec.md`
//! §4.2/§4.3, collapsed into one type since Tokio's `TcpStream` already
//! gives us non-blocking, backpressured reads and writes; a hand-rolled
//! ring buffer on top would just duplicate what `AsyncRead`/`AsyncWrite`
//! and the bounded codec below already provide.

mod codec;
mod connection;
mod error;

pub use codec::MessageCodec;
pub use connection::{JsonConnection, JsonReceiver, JsonSender};
pub use error::FramingError;
