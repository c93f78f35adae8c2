use distbuild_core::Message;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::MessageCodec;
use crate::error::FramingError;

/// A framed JSON connection over one TCP socket. `send`/`recv` are the
/// async equivalents of the original `JsonMachine.send` / the
/// `JsonNewMessage` event; `Eof` surfaces as `recv` returning `Ok(None)`.
pub struct JsonConnection {
    inner: Framed<TcpStream, MessageCodec>,
}

impl JsonConnection {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        JsonConnection {
            inner: Framed::new(stream, MessageCodec::new()),
        }
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), FramingError> {
        self.inner.send(msg).await
    }

    /// `None` means clean EOF; `Some(Err(_))` is a transport or parse
    /// error, treated identically (`spec.md` §7): the caller closes.
    pub async fn recv(&mut self) -> Option<Result<Message, FramingError>> {
        self.inner.next().await
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.inner.get_ref().peer_addr()
    }

    /// Splits into independent send/receive halves so the read loop and
    /// write path can live on separate Tokio tasks without a mutex.
    pub fn split(self) -> (JsonSender, JsonReceiver) {
        let (sink, stream) = self.inner.split();
        (JsonSender { inner: sink }, JsonReceiver { inner: stream })
    }
}

pub struct JsonSender {
    inner: futures::stream::SplitSink<Framed<TcpStream, MessageCodec>, Message>,
}

impl JsonSender {
    pub async fn send(&mut self, msg: Message) -> Result<(), FramingError> {
        self.inner.send(msg).await
    }
}

pub struct JsonReceiver {
    inner: futures::stream::SplitStream<Framed<TcpStream, MessageCodec>>,
}

impl JsonReceiver {
    pub async fn recv(&mut self) -> Option<Result<Message, FramingError>> {
        self.inner.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_and_receive_round_trip_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = JsonConnection::new(stream);
            let msg = conn.recv().await.unwrap().unwrap();
            conn.send(msg).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = JsonConnection::new(stream);
        let sent = Message::HelperReady { id: "h-1".into() };
        conn.send(sent.clone()).await.unwrap();
        let echoed = conn.recv().await.unwrap().unwrap();
        assert_eq!(echoed, sent);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_returns_none_on_clean_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = JsonConnection::new(stream);
        assert!(conn.recv().await.is_none());
        server.await.unwrap();
    }
}
