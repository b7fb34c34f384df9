use crate::{close, Error, Frame, Message, Opcode, ProtocolError};

/// Rebuilds messages from frames in arrival order.
///
/// At most one data message is in progress at a time. Control frames are handed back as soon
/// as they arrive and leave the partial message alone.
#[derive(Debug)]
pub struct Reassembler {
    pending: Option<Pending>,
    max_message_size: usize,
}

#[derive(Debug)]
struct Pending {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            pending: None,
            max_message_size,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Feeds one frame. Returns a message once one is complete.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, Error> {
        match frame.opcode {
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Message::Pong(frame.payload))),
            Opcode::Close => Ok(Some(Message::Close(close::decode_payload(&frame.payload)?))),

            Opcode::Text | Opcode::Binary => {
                if self.pending.is_some() {
                    return Err(ProtocolError::ExpectedContinuation.into());
                }
                self.check_size(frame.payload.len())?;

                if frame.fin {
                    return complete(frame.opcode, frame.payload).map(Some);
                }
                self.pending = Some(Pending {
                    opcode: frame.opcode,
                    payload: frame.payload,
                });
                Ok(None)
            }

            Opcode::Continuation => {
                let Some(mut pending) = self.pending.take() else {
                    return Err(ProtocolError::UnexpectedContinuation.into());
                };
                self.check_size(pending.payload.len() + frame.payload.len())?;

                pending.payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    return complete(pending.opcode, pending.payload).map(Some);
                }
                self.pending = Some(pending);
                Ok(None)
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), Error> {
        if size > self.max_message_size {
            return Err(Error::BufferOverflow {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn complete(opcode: Opcode, payload: Vec<u8>) -> Result<Message, Error> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| ProtocolError::InvalidUtf8.into()),
        _ => Ok(Message::Binary(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(opcode: Opcode, payload: &[u8], fin: bool) -> Frame {
        Frame::new(opcode, payload.to_vec()).with_fin(fin)
    }

    #[test]
    fn ping_between_fragments_is_delivered_first() {
        let mut reassembler = Reassembler::new(1024);
        let mut delivered = Vec::new();
        let frames = [
            fragment(Opcode::Text, b"ab", false),
            fragment(Opcode::Continuation, b"c", false),
            fragment(Opcode::Ping, b"p", true),
            fragment(Opcode::Continuation, b"d", true),
        ];
        for frame in frames {
            if let Some(message) = reassembler.push(frame).unwrap() {
                delivered.push(message);
            }
        }

        assert_eq!(
            delivered,
            vec![
                Message::Ping(b"p".to_vec()),
                Message::Text("abcd".into())
            ]
        );
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn close_mid_message_keeps_the_partial_message() {
        let mut reassembler = Reassembler::new(1024);
        assert_eq!(
            reassembler
                .push(fragment(Opcode::Binary, &[1], false))
                .unwrap(),
            None
        );
        assert_eq!(
            reassembler.push(fragment(Opcode::Close, &[], true)).unwrap(),
            Some(Message::Close(None))
        );
        assert!(reassembler.in_progress());
    }

    #[test]
    fn continuation_without_start_is_an_error() {
        let mut reassembler = Reassembler::new(1024);
        let err = reassembler
            .push(fragment(Opcode::Continuation, b"x", true))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedContinuation)
        ));
    }

    #[test]
    fn new_message_while_one_is_in_progress_is_an_error() {
        let mut reassembler = Reassembler::new(1024);
        reassembler
            .push(fragment(Opcode::Text, b"x", false))
            .unwrap();
        let err = reassembler
            .push(fragment(Opcode::Binary, b"y", true))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ExpectedContinuation)
        ));
    }

    #[test]
    fn invalid_utf8_is_detected_on_completion() {
        let mut reassembler = Reassembler::new(1024);
        reassembler
            .push(fragment(Opcode::Text, &[0xe2, 0x82], false))
            .unwrap();
        let err = reassembler
            .push(fragment(Opcode::Continuation, &[0x28], true))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidUtf8)));
        assert_eq!(err.close_code(), crate::CloseCode::Invalid);
    }

    #[test]
    fn utf8_split_across_fragments_is_fine() {
        let mut reassembler = Reassembler::new(1024);
        let euro = "€".as_bytes();
        reassembler
            .push(fragment(Opcode::Text, &euro[..1], false))
            .unwrap();
        let message = reassembler
            .push(fragment(Opcode::Continuation, &euro[1..], true))
            .unwrap();
        assert_eq!(message, Some(Message::Text("€".into())));
    }

    #[test]
    fn message_size_is_bounded() {
        let mut reassembler = Reassembler::new(4);
        reassembler
            .push(fragment(Opcode::Binary, &[0; 3], false))
            .unwrap();
        let err = reassembler
            .push(fragment(Opcode::Continuation, &[0; 2], true))
            .unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { size: 5, max: 4 }));
        assert_eq!(err.close_code(), crate::CloseCode::Size);
    }
}
