use bytes::{Buf, BytesMut};
use distbuild_core::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// One read buffer cap per connection (`spec.md` §4.2's bounded
/// `max_buffer`): a message line longer than this is treated as a
/// transport error rather than allowed to grow the buffer unboundedly.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Frames one JSON object per `\n`-terminated line (`spec.md` §4.3).
#[derive(Debug, Default)]
pub struct MessageCodec {
    _private: (),
}

impl MessageCodec {
    pub fn new() -> Self {
        MessageCodec::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FramingError> {
        let Some(newline_at) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_LINE_BYTES {
                return Err(FramingError::LineTooLong(MAX_LINE_BYTES));
            }
            return Ok(None);
        };

        let line = src.split_to(newline_at);
        src.advance(1); // drop the newline itself
        let msg: Message = serde_json::from_slice(&line)?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FramingError> {
        let encoded = serde_json::to_vec(&item)?;
        dst.extend_from_slice(&encoded);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
