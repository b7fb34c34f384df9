use crate::{mask::mask_payload, Error, MaskingKeyGenerator, ProtocolError, Role};
use bytes::{Buf, BytesMut};
use std::{collections::HashMap, mem::size_of, sync::Arc};

pub const FIN: u16 = 0b1000_0000_0000_0000;
pub const RSV1: u16 = 0b0100_0000_0000_0000;
pub const RSV2: u16 = 0b0010_0000_0000_0000;
pub const RSV3: u16 = 0b0001_0000_0000_0000;
pub const RSV: u16 = RSV1 | RSV2 | RSV3;
pub const OPCODE: u16 = 0b0000_1111_0000_0000;
pub const MASK: u16 = 0b0000_0000_1000_0000;
pub const PAYLOAD_LEN: u16 = 0b0000_0000_0111_1111;
pub const SMALL_PAYLOAD: u16 = 0b0000_0000_0111_1101;
pub const SMALL_PAYLOAD_USIZE: usize = SMALL_PAYLOAD as usize;
pub const EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1110;
pub const BIG_EXTENDED_PAYLOAD: u16 = 0b0000_0000_0111_1111;
pub const FIRST_SHORT_SIZE: usize = size_of::<u16>();
pub const EXTENDED_PAYLOAD_SIZE: usize = size_of::<u16>();
pub const BIG_EXTENDED_PAYLOAD_SIZE: usize = size_of::<u64>();
pub const MASK_KEY_SIZE: usize = size_of::<u32>();
pub const MAX_CONTROL_PAYLOAD: usize = SMALL_PAYLOAD_USIZE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl Opcode {
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Continuation),
            1 => Ok(Opcode::Text),
            2 => Ok(Opcode::Binary),
            8 => Ok(Opcode::Close),
            9 => Ok(Opcode::Ping),
            10 => Ok(Opcode::Pong),
            other => Err(ProtocolError::ReservedOpcode(other)),
        }
    }
}

/// A single WebSocket frame with an unmasked payload.
///
/// `metadata` is an opaque bag extensions may use to hand information down the pipeline. It
/// never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
    mask_key: Option<u32>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Frame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload,
            metadata: HashMap::new(),
            mask_key: None,
        }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Same header and metadata, different payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Frame {
            payload,
            metadata: self.metadata.clone(),
            ..*self
        }
    }

    /// Masking key the frame arrived with, if any.
    pub fn mask_key(&self) -> Option<u32> {
        self.mask_key
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    fn first_byte(&self) -> u8 {
        let mut byte = self.opcode as u8;
        if self.fin {
            byte |= (FIN >> 8) as u8;
        }
        if self.rsv1 {
            byte |= (RSV1 >> 8) as u8;
        }
        if self.rsv2 {
            byte |= (RSV2 >> 8) as u8;
        }
        if self.rsv3 {
            byte |= (RSV3 >> 8) as u8;
        }
        byte
    }
}

/// Turns bytes into frames and back for one side of a connection.
///
/// Clients mask everything they send with a key from the configured generator and refuse
/// masked frames from the server. Servers do the opposite.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
    reserved_bits: u16,
    masking: Option<Arc<dyn MaskingKeyGenerator>>,
}

impl FrameCodec {
    pub fn client(max_frame_size: usize, masking: Arc<dyn MaskingKeyGenerator>) -> Self {
        FrameCodec {
            role: Role::Client,
            max_frame_size,
            reserved_bits: 0,
            masking: Some(masking),
        }
    }

    pub fn server(max_frame_size: usize) -> Self {
        FrameCodec {
            role: Role::Server,
            max_frame_size,
            reserved_bits: 0,
            masking: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Allows RSV bits (1, 2 or 3) that a negotiated extension uses.
    pub fn claim_reserved_bit(&mut self, bit: u8) {
        self.reserved_bits |= match bit {
            1 => RSV1,
            2 => RSV2,
            3 => RSV3,
            _ => 0,
        };
    }

    /// Parses one frame off the front of `buffer`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the buffer is only consumed once a whole
    /// frame is available.
    pub fn unframe(&self, buffer: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if buffer.len() < FIRST_SHORT_SIZE {
            return Ok(None);
        }

        let first_short = u16::from_be_bytes([buffer[0], buffer[1]]);
        if first_short & RSV & !self.reserved_bits != 0 {
            return Err(ProtocolError::RsvSet.into());
        }

        let opcode = Opcode::try_from(((first_short & OPCODE) >> 8) as u8)?;
        let fin = first_short & FIN != 0;
        let short_len = first_short & PAYLOAD_LEN;
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl.into());
            }
            if short_len > SMALL_PAYLOAD {
                return Err(ProtocolError::TooLargeControl.into());
            }
        }

        let masked = first_short & MASK != 0;
        match (self.role, masked) {
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame.into()),
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame.into()),
            _ => {}
        }

        let payload_len_size = match short_len {
            0..=SMALL_PAYLOAD => 0,
            EXTENDED_PAYLOAD => EXTENDED_PAYLOAD_SIZE,
            _ => BIG_EXTENDED_PAYLOAD_SIZE,
        };
        let mask_key_size = if masked { MASK_KEY_SIZE } else { 0 };
        let header_size = FIRST_SHORT_SIZE + payload_len_size + mask_key_size;
        if buffer.len() < header_size {
            return Ok(None);
        }

        let extended = &buffer[FIRST_SHORT_SIZE..FIRST_SHORT_SIZE + payload_len_size];
        let payload_len = match payload_len_size {
            0 => short_len as u64,
            EXTENDED_PAYLOAD_SIZE => u16::from_be_bytes([extended[0], extended[1]]) as u64,
            _ => {
                let mut bytes = [0u8; BIG_EXTENDED_PAYLOAD_SIZE];
                bytes.copy_from_slice(extended);
                u64::from_be_bytes(bytes)
            }
        };
        // most significant bit must be zero
        if payload_len >> 63 != 0 {
            return Err(ProtocolError::InvalidPayloadLen.into());
        }

        let frame_size = usize::try_from(payload_len)
            .ok()
            .and_then(|len| len.checked_add(header_size))
            .ok_or(ProtocolError::InvalidPayloadLen)?;
        if frame_size > self.max_frame_size {
            return Err(Error::BufferOverflow {
                size: frame_size,
                max: self.max_frame_size,
            });
        }
        if buffer.len() < frame_size {
            return Ok(None);
        }

        let mask_key = masked.then(|| {
            let at = FIRST_SHORT_SIZE + payload_len_size;
            u32::from_be_bytes([buffer[at], buffer[at + 1], buffer[at + 2], buffer[at + 3]])
        });

        buffer.advance(header_size);
        let mut payload = buffer.split_to(frame_size - header_size).to_vec();
        if let Some(mask_key) = mask_key {
            mask_payload(&mut payload, mask_key);
        }

        Ok(Some(Frame {
            fin,
            rsv1: first_short & RSV1 != 0,
            rsv2: first_short & RSV2 != 0,
            rsv3: first_short & RSV3 != 0,
            opcode,
            payload,
            metadata: HashMap::new(),
            mask_key,
        }))
    }

    /// Serializes a frame, masking it when this codec speaks for a client.
    pub fn frame(&self, frame: &Frame) -> Result<Vec<u8>, Error> {
        if frame.is_control() {
            if !frame.fin {
                return Err(ProtocolError::FragmentedControl.into());
            }
            if frame.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::TooLargeControl.into());
            }
        }

        let mask_key = match &self.masking {
            Some(masking) => Some(masking.next_key()?),
            None => None,
        };

        let len = frame.payload.len();
        let mut bytes = Vec::with_capacity(
            FIRST_SHORT_SIZE + BIG_EXTENDED_PAYLOAD_SIZE + MASK_KEY_SIZE + len,
        );
        bytes.push(frame.first_byte());

        let mask_bit = if mask_key.is_some() { MASK as u8 } else { 0 };
        if len <= SMALL_PAYLOAD_USIZE {
            bytes.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            bytes.push(mask_bit | EXTENDED_PAYLOAD as u8);
            bytes.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            bytes.push(mask_bit | BIG_EXTENDED_PAYLOAD as u8);
            bytes.extend_from_slice(&(len as u64).to_be_bytes());
        }

        let payload_start = match mask_key {
            Some(mask_key) => {
                bytes.extend_from_slice(&mask_key.to_be_bytes());
                let start = bytes.len();
                bytes.extend_from_slice(&frame.payload);
                mask_payload(&mut bytes[start..], mask_key);
                start
            }
            None => {
                let start = bytes.len();
                bytes.extend_from_slice(&frame.payload);
                start
            }
        };
        debug_assert_eq!(bytes.len() - payload_start, len);

        Ok(bytes)
    }
}
