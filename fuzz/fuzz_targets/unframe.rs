#![no_main]

use bytes::{BufMut, BytesMut};
use cobaltite::{frame::FrameCodec, mask::FixedMaskingKey, reassemble::Reassembler};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let mut buffer = BytesMut::new();
    buffer.put(data);

    let codec = FrameCodec::client(1 << 16, Arc::new(FixedMaskingKey(0x1234_5678)));
    let mut reassembler = Reassembler::new(1 << 16);
    while let Ok(Some(frame)) = codec.unframe(&mut buffer) {
        if reassembler.push(frame).is_err() {
            break;
        }
    }

    let mut buffer = BytesMut::new();
    buffer.put(data);
    let _frame = FrameCodec::server(1 << 16).unframe(&mut buffer);
});
