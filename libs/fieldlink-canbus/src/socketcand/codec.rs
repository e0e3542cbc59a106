//! Tokio codec for the socketcand wire framing
//!
//! Messages are `<`-to-`>` spans of ASCII; anything between messages is
//! ignored. Malformed spans are skipped, not fatal: the reader loop treats a
//! single bad message as noise.

use super::message::Message;
use bytes::{Buf, BytesMut};
use errors::FieldLinkError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Upper bound on one message span; a run this long without a closing `>`
/// means the stream is hosed
const MAX_MESSAGE_LEN: usize = 4096;

/// Codec for `< verb arg... >` messages
#[derive(Debug, Default)]
pub struct SocketcandCodec;

impl Decoder for SocketcandCodec {
    type Item = Message;
    type Error = FieldLinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FieldLinkError> {
        loop {
            // discard anything before the next message start
            match src.iter().position(|&b| b == b'<') {
                Some(start) if start > 0 => src.advance(start),
                Some(_) => {},
                None => {
                    src.clear();
                    return Ok(None);
                },
            }
            let Some(end) = src.iter().position(|&b| b == b'>') else {
                if src.len() > MAX_MESSAGE_LEN {
                    return Err(FieldLinkError::Protocol(format!(
                        "unterminated message exceeds {MAX_MESSAGE_LEN} bytes"
                    )));
                }
                return Ok(None);
            };
            let span = src.split_to(end + 1);
            let inner = &span[1..span.len() - 1];
            let Ok(text) = std::str::from_utf8(inner) else {
                warn!("skipping non-ASCII message span of {} bytes", span.len());
                continue;
            };
            let mut tokens = text.split_whitespace();
            let Some(verb) = tokens.next() else {
                warn!("skipping empty message");
                continue;
            };
            return Ok(Some(Message::raw(verb, tokens.map(String::from).collect())));
        }
    }
}

impl Encoder<Message> for SocketcandCodec {
    type Error = FieldLinkError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), FieldLinkError> {
        dst.extend_from_slice(b"< ");
        dst.extend_from_slice(message.verb().as_bytes());
        for arg in message.args() {
            dst.extend_from_slice(b" ");
            dst.extend_from_slice(arg.as_bytes());
        }
        dst.extend_from_slice(b" >");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut SocketcandCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = codec.decode(buf) {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_decode_single_message() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::from(&b"< hi >"[..]);
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages, vec![Message::raw("hi", Vec::new())]);
    }

    #[test]
    fn test_decode_incremental_feed() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::from(&b"< fra"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"me 1 23.424242 11 22");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b" >< ok >");
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].verb(), "frame");
        assert_eq!(messages[0].args().len(), 4);
        assert_eq!(messages[1].verb(), "ok");
    }

    #[test]
    fn test_decode_skips_interstitial_garbage() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::from(&b"\r\n< hi >junk< ok >\n"[..]);
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].verb(), "hi");
        assert_eq!(messages[1].verb(), "ok");
    }

    #[test]
    fn test_decode_skips_empty_message() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::from(&b"<>< echo >"[..]);
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].verb(), "echo");
    }

    #[test]
    fn test_decode_rejects_unterminated_run() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::from(&b"<"[..]);
        buf.extend_from_slice(&vec![b'x'; MAX_MESSAGE_LEN + 1]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_round_trip() {
        let mut codec = SocketcandCodec;
        let mut buf = BytesMut::new();
        let message = Message::raw(
            "subscribe",
            vec!["1".to_string(), "0".to_string(), "0".to_string()],
        );
        codec.encode(message.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"< subscribe 1 0 0 >");
        let decoded = codec.decode(&mut buf).unwrap().expect("one message");
        assert_eq!(decoded, message);
    }
}
