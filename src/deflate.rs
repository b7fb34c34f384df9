//! `permessage-deflate` (RFC 7692).
//!
//! Each message is compressed as raw DEFLATE with a sync flush. The trailing `00 00 ff ff` of the
//! flush is stripped from the last frame of a message and put back before inflating. RSV1 marks
//! the first frame of a compressed message.

use crate::{
    extension::{Extension, ExtensionContext, ExtensionParameter},
    Error, Frame, Opcode,
};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tracing::trace;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";

#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    level: Compression,
    request_no_context_takeover: bool,
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        PerMessageDeflate {
            level: Compression::default(),
            request_no_context_takeover: false,
        }
    }
}

impl PerMessageDeflate {
    pub fn new(level: u32) -> Self {
        PerMessageDeflate {
            level: Compression::new(level),
            ..Default::default()
        }
    }

    /// Ask the server to let the client reset its compressor after every message.
    pub fn client_no_context_takeover(mut self) -> Self {
        self.request_no_context_takeover = true;
        self
    }
}

struct DeflateState {
    compress: Compress,
    decompress: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
    // incoming message started with RSV1 and is not finished yet
    inflating: bool,
    // bytes inflated so far for the current incoming message
    inflated: usize,
    // outgoing message has had its first frame sent
    deflating: bool,
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn parameters(&self) -> Vec<ExtensionParameter> {
        if self.request_no_context_takeover {
            vec![ExtensionParameter::new(CLIENT_NO_CONTEXT_TAKEOVER, None)]
        } else {
            Vec::new()
        }
    }

    fn reserved_bits(&self) -> Vec<u8> {
        vec![1]
    }

    fn on_handshake_response(
        &self,
        context: &mut ExtensionContext,
        parameters: &[ExtensionParameter],
    ) -> Result<(), Error> {
        let flag = |name: &str| parameters.iter().any(|parameter| parameter.name == name);
        context.insert(DeflateState {
            compress: Compress::new(self.level, false),
            decompress: Decompress::new(false),
            reset_compress: self.request_no_context_takeover || flag(CLIENT_NO_CONTEXT_TAKEOVER),
            reset_decompress: flag(SERVER_NO_CONTEXT_TAKEOVER),
            inflating: false,
            inflated: 0,
            deflating: false,
        });
        Ok(())
    }

    fn process_incoming(
        &self,
        context: &mut ExtensionContext,
        frame: &Frame,
    ) -> Result<Option<Frame>, Error> {
        let max = context.max_message_size();
        let Some(state) = context.get_mut::<DeflateState>() else {
            return Ok(None);
        };
        if frame.is_control() {
            return Ok(None);
        }

        match frame.opcode {
            Opcode::Text | Opcode::Binary if frame.rsv1 => {
                state.inflating = true;
                state.inflated = 0;
            }
            Opcode::Continuation if state.inflating => {}
            _ => return Ok(None),
        }

        let mut payload = inflate(&mut state.decompress, &frame.payload, state.inflated, max)?;
        if frame.fin {
            let already = state.inflated + payload.len();
            payload.extend(inflate(&mut state.decompress, &TAIL, already, max)?);
        }
        state.inflated += payload.len();
        trace!(compressed = frame.payload.len(), inflated = payload.len(), "inflated frame");

        let mut inflated = frame.with_payload(payload);
        inflated.rsv1 = false;
        if frame.fin {
            state.inflating = false;
            state.inflated = 0;
            if state.reset_decompress {
                state.decompress.reset(false);
            }
        }
        Ok(Some(inflated))
    }

    fn process_outgoing(
        &self,
        context: &mut ExtensionContext,
        frame: &Frame,
    ) -> Result<Option<Frame>, Error> {
        let Some(state) = context.get_mut::<DeflateState>() else {
            return Ok(None);
        };
        if frame.is_control() {
            return Ok(None);
        }

        let mut output = deflate(&mut state.compress, &frame.payload)?;
        if frame.fin && output.ends_with(&TAIL) {
            output.truncate(output.len() - TAIL.len());
        }
        let mut deflated = frame.with_payload(output);
        deflated.rsv1 = !state.deflating && frame.opcode != Opcode::Continuation;

        state.deflating = !frame.fin;
        if frame.fin && state.reset_compress {
            state.compress.reset();
        }
        Ok(Some(deflated))
    }

    fn destroy(&self, context: &mut ExtensionContext) {
        context.remove::<DeflateState>();
    }
}

fn compression_error(message: impl std::fmt::Display) -> Error {
    Error::Extension {
        name: PERMESSAGE_DEFLATE,
        message: message.to_string(),
    }
}

fn deflate(compress: &mut Compress, input: &[u8]) -> Result<Vec<u8>, Error> {
    let mut output = Vec::with_capacity(input.len() + 64);
    let start = compress.total_in();
    loop {
        if output.len() == output.capacity() {
            output.reserve(output.capacity().max(64));
        }
        let consumed = (compress.total_in() - start) as usize;
        let before = compress.total_out();
        compress
            .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
            .map_err(compression_error)?;

        let consumed = (compress.total_in() - start) as usize;
        let stalled = before == compress.total_out();
        if consumed == input.len() && (output.len() < output.capacity() || stalled) {
            return Ok(output);
        }
    }
}

/// Inflates `input` as part of a message that already produced `already` bytes, failing with
/// [`Error::BufferOverflow`] as soon as the message grows past `max`.
fn inflate(
    decompress: &mut Decompress,
    input: &[u8],
    already: usize,
    max: usize,
) -> Result<Vec<u8>, Error> {
    let limit = max.saturating_sub(already);
    let overflow = |size: usize| Error::BufferOverflow {
        size: already.saturating_add(size),
        max,
    };
    if already > max {
        return Err(overflow(0));
    }

    // never hold more than one byte past the limit
    let ceiling = limit.saturating_add(1);
    let mut output = Vec::with_capacity((input.len() * 2 + 64).min(ceiling));
    let start = decompress.total_in();
    loop {
        if output.len() == output.capacity() {
            let room = output.capacity().max(64).min(ceiling - output.len());
            output.reserve_exact(room);
        }
        let consumed = (decompress.total_in() - start) as usize;
        let before = (decompress.total_in(), decompress.total_out());
        decompress
            .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
            .map_err(compression_error)?;

        if output.len() > limit {
            return Err(overflow(output.len()));
        }
        let consumed = (decompress.total_in() - start) as usize;
        let stalled = before == (decompress.total_in(), decompress.total_out());
        if consumed == input.len() && (output.len() < output.capacity() || stalled) {
            return Ok(output);
        }
        if stalled {
            return Err(compression_error("no progress while inflating"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{negotiate, parse_header, Extension, NegotiatedExtensions};
    use std::sync::Arc;

    fn pipeline(header: &str) -> NegotiatedExtensions {
        limited(header, usize::MAX)
    }

    fn limited(header: &str, max_message_size: usize) -> NegotiatedExtensions {
        let installed: Vec<Arc<dyn Extension>> = vec![Arc::new(PerMessageDeflate::default())];
        negotiate(&parse_header([header]), &installed, max_message_size).unwrap()
    }

    #[test]
    fn compresses_and_inflates_a_message() {
        let mut sender = pipeline("permessage-deflate");
        let mut receiver = pipeline("permessage-deflate");
        let text = "dumpty yikes dumpty donkey dooby donkey ".repeat(20);

        let compressed = sender
            .outgoing(Frame::new(Opcode::Text, text.clone().into_bytes()))
            .unwrap();
        assert!(compressed.rsv1);
        assert!(compressed.payload.len() < text.len());
        assert!(!compressed.payload.ends_with(&TAIL));

        let inflated = receiver.incoming(compressed).unwrap();
        assert!(!inflated.rsv1);
        assert_eq!(inflated.payload, text.as_bytes());
    }

    #[test]
    fn context_carries_over_between_messages() {
        let mut sender = pipeline("permessage-deflate");
        let mut receiver = pipeline("permessage-deflate");
        for _ in 0..3 {
            let frame = sender.outgoing(Frame::new(Opcode::Binary, vec![42; 500])).unwrap();
            assert_eq!(receiver.incoming(frame).unwrap().payload, vec![42; 500]);
        }
    }

    #[test]
    fn fragmented_message_sets_rsv1_only_on_the_first_frame() {
        let mut sender = pipeline("permessage-deflate; client_no_context_takeover");
        let mut receiver = pipeline("permessage-deflate; server_no_context_takeover");

        let first = sender
            .outgoing(Frame::new(Opcode::Text, b"hello ".to_vec()).with_fin(false))
            .unwrap();
        let second = sender
            .outgoing(Frame::new(Opcode::Continuation, b"world".to_vec()))
            .unwrap();
        assert!(first.rsv1);
        assert!(!second.rsv1);

        let mut payload = receiver.incoming(first).unwrap().payload;
        payload.extend(receiver.incoming(second).unwrap().payload);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn uncompressed_frames_pass_through() {
        let mut receiver = pipeline("permessage-deflate");
        let frame = receiver
            .incoming(Frame::new(Opcode::Text, b"plain".to_vec()))
            .unwrap();
        assert_eq!(frame.payload, b"plain");
        let ping = receiver.incoming(Frame::new(Opcode::Ping, b"p".to_vec())).unwrap();
        assert_eq!(ping.payload, b"p");
    }

    #[test]
    fn garbage_is_passed_through_unmodified() {
        let mut receiver = pipeline("permessage-deflate");
        let mut frame = Frame::new(Opcode::Binary, vec![0xff; 16]);
        frame.rsv1 = true;
        let frame = receiver.incoming(frame).unwrap();
        assert!(frame.rsv1);
        assert_eq!(frame.payload, vec![0xff; 16]);
    }

    #[test]
    fn inflating_past_the_message_limit_overflows() {
        let mut sender = pipeline("permessage-deflate");
        let mut receiver = limited("permessage-deflate", 1 << 16);
        let bomb = sender
            .outgoing(Frame::new(Opcode::Binary, vec![0; 16 << 20]))
            .unwrap();
        assert!(bomb.payload.len() < 1 << 17);

        match receiver.incoming(bomb) {
            Err(Error::BufferOverflow { size, max }) => {
                assert_eq!(max, 1 << 16);
                assert!(size > max);
                assert!(size <= (1 << 16) + 1);
            }
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn limit_counts_every_frame_of_a_message() {
        let mut sender = pipeline("permessage-deflate");
        let mut receiver = limited("permessage-deflate", 1000);
        let first = sender
            .outgoing(Frame::new(Opcode::Binary, vec![7; 600]).with_fin(false))
            .unwrap();
        let second = sender
            .outgoing(Frame::new(Opcode::Continuation, vec![7; 600]))
            .unwrap();

        assert_eq!(receiver.incoming(first).unwrap().payload.len(), 600);
        assert!(matches!(
            receiver.incoming(second),
            Err(Error::BufferOverflow { max: 1000, .. })
        ));
    }

    #[test]
    fn limit_resets_between_messages() {
        let mut sender = pipeline("permessage-deflate");
        let mut receiver = limited("permessage-deflate", 1000);
        for _ in 0..4 {
            let frame = sender.outgoing(Frame::new(Opcode::Text, vec![b'a'; 900])).unwrap();
            assert_eq!(receiver.incoming(frame).unwrap().payload.len(), 900);
        }
    }
}
