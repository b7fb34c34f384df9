use crate::{Close, Error, ProtocolError};

/// Status codes carried by close frames.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000, the purpose of the connection was fulfilled.
    Normal,
    /// 1001, the endpoint is going away.
    Away,
    /// 1002, the peer violated the framing protocol.
    Protocol,
    /// 1003, the endpoint cannot accept this kind of data.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    Status,
    /// 1006, the connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007, message data did not match its type, e.g. invalid UTF-8 in a text message.
    Invalid,
    /// 1008, generic policy violation.
    Policy,
    /// 1009, the message was too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    Extension,
    /// 1011, unexpected server condition.
    Error,
    /// 1012
    Restart,
    /// 1013
    Again,
    /// 1015, TLS handshake failure. Never sent on the wire.
    Tls,
    Reserved(u16),
    Iana(u16),
    Library(u16),
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may appear in a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

pub(crate) fn encode_payload(close: Option<&Close>) -> Vec<u8> {
    let Some(close) = close else {
        return Vec::new();
    };

    let mut payload = u16::from(close.code).to_be_bytes().to_vec();
    // 125 byte control frame limit, minus the status code
    let mut end = close.reason.len().min(123);
    while !close.reason.is_char_boundary(end) {
        end -= 1;
    }
    payload.extend_from_slice(&close.reason.as_bytes()[..end]);
    payload
}

pub(crate) fn decode_payload(payload: &[u8]) -> Result<Option<Close>, Error> {
    match payload {
        [] => Ok(None),
        [_] => Err(ProtocolError::InvalidClosePayload.into()),
        [high, low, reason @ ..] => {
            let raw = u16::from_be_bytes([*high, *low]);
            let code = CloseCode::from(raw);
            if !code.is_allowed() {
                return Err(ProtocolError::InvalidCloseCode(raw).into());
            }

            let reason = std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Some(Close {
                code,
                reason: reason.into(),
            }))
        }
    }
}
