//! Client-side WebSocket protocol engine.
//!
//! The [`ClientEngine`] drives the HTTP upgrade handshake (redirects, authentication challenges,
//! Retry-After backpressure) and the [`WebSocket`] session drives RFC 6455 framing once the
//! upgrade succeeds. [`ClientManager`] ties both to a [`Transport`] with a reconnect policy.

pub mod auth;
pub mod buffer;
pub mod client;
pub mod close;
pub mod config;
pub mod deflate;
pub mod engine;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod reassemble;
pub mod reconnect;
mod socket;

pub use auth::{AuthConfig, Authenticator, Credentials};
pub use client::{ClientManager, ConnectionHandle, Endpoint, TcpTransport, Transport};
pub use close::CloseCode;
pub use config::ClientConfig;
pub use engine::{ClientEngine, HandshakeState, UpgradeOutcome};
pub use extension::{Extension, ExtensionContext};
pub use frame::{Frame, Opcode};
pub use mask::MaskingKeyGenerator;
pub use reconnect::ReconnectPolicy;
pub use socket::{SessionState, WebSocket};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    TokioIo(#[from] tokio::io::Error),
    #[error("Could not get random data")]
    GetRandom(getrandom::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("URL does not have a host")]
    NoHost,
    #[error("Incorrect scheme, not one of \"ws\" or \"wss\": {0}")]
    IncorrectScheme(String),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Redirect failed: {0}")]
    Redirect(#[from] RedirectError),
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("Service unavailable, retry after {delay:?} seconds")]
    RetryAfter { delay: Option<i64> },
    #[error("Buffer overflow: {size} bytes exceeds the limit of {max}")]
    BufferOverflow { size: usize, max: usize },
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Extension {name} failed: {message}")]
    Extension { name: &'static str, message: String },
    #[error("Invalid UTF-8: {0:?}")]
    Utf8(Utf8Error),
    #[error("Handshake response not received within {0:?}")]
    Timeout(Duration),
    #[error("Tried to send/receive a message on a closed websocket")]
    WasClosed,
    #[error("The websocket has been closed")]
    Closed(Option<Close>),
    #[error("Connection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Handshake engine misuse: {0}")]
    IllegalState(&'static str),
    #[error("Connection failed after {attempts} attempt(s)")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl From<getrandom::Error> for Error {
    fn from(error: getrandom::Error) -> Self {
        Error::GetRandom(error)
    }
}

impl Error {
    /// True when the peer finished the closing handshake with a normal status.
    pub fn closed_normally(&self) -> bool {
        match self {
            Error::Closed(None) => true,
            Error::Closed(Some(close)) => close.code == CloseCode::Normal,
            _ => false,
        }
    }

    /// Close code to send when this error terminates an open connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::BufferOverflow { .. } => CloseCode::Size,
            Error::Protocol(ProtocolError::InvalidUtf8) | Error::Utf8(_) => CloseCode::Invalid,
            _ => CloseCode::Protocol,
        }
    }

    /// Walks `ConnectFailed` wrappers down to the error of the last attempt.
    pub fn root(&self) -> &Error {
        match self {
            Error::ConnectFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Got an unexpected HTTP status in response: {0}")]
    UnexpectedStatus(u16),
    #[error("Got an unexpected HTTP response line: {0}")]
    UnexpectedResponse(String),
    #[error("Missing or invalid header: {0}")]
    MissingOrInvalidHeader(String),
    #[error("Server selected a subprotocol that was not offered: {0}")]
    UnexpectedSubprotocol(String),
    #[error("Response headers exceeded {0} bytes")]
    HeadersTooLong(usize),
    #[error("Response body cannot be skipped on a reused connection: {0}")]
    UnskippableBody(&'static str),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RedirectError {
    #[error("Redirection is not enabled (status {status})")]
    NotEnabled { status: u16 },
    #[error("Redirect response {status} has no Location header")]
    MissingLocation { status: u16 },
    #[error("Redirect response {status} has an unusable Location: {location}")]
    InvalidLocation { status: u16, location: String },
    #[error("Infinite loop detected while following redirects (status {status})")]
    InfiniteLoop { status: u16 },
    #[error("Redirect threshold of {threshold} exceeded (status {status})")]
    ThresholdExceeded { status: u16, threshold: usize },
    #[error("Redirect response {status} leaves the connected host: {location}")]
    OtherHost { status: u16, location: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Server rejected the credentials")]
    AlreadyAttempted,
    #[error("WWW-Authenticate header is missing or empty")]
    MissingChallenge,
    #[error("No authenticator registered for scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("Credentials are required but were not configured")]
    MissingCredentials,
    #[error("Malformed challenge: {0}")]
    InvalidChallenge(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("RSV bits were set without an extension claiming them")]
    RsvSet,
    #[error("Got a fragmented control frame")]
    FragmentedControl,
    #[error("Got control frame larger than 125 bytes")]
    TooLargeControl,
    #[error("Reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("New data frame while a fragmented message is in progress")]
    ExpectedContinuation,
    #[error("Invalid payload length")]
    InvalidPayloadLen,
    #[error("Server sent a masked frame")]
    MaskedFrame,
    #[error("Client sent an unmasked frame")]
    UnmaskedFrame,
    #[error("Invalid UTF-8 in text message or close reason")]
    InvalidUtf8,
    #[error("Invalid close frame payload")]
    InvalidClosePayload,
    #[error("Close code {0} is not allowed on the wire")]
    InvalidCloseCode(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8Error {
    Handshake,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub code: CloseCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<Close>),
}

impl Message {
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    pub(crate) fn into_opcode_payload(self) -> (Opcode, Vec<u8>) {
        match self {
            Message::Text(text) => (Opcode::Text, text.into_bytes()),
            Message::Binary(data) => (Opcode::Binary, data),
            Message::Ping(data) => (Opcode::Ping, data),
            Message::Pong(data) => (Opcode::Pong, data),
            Message::Close(close) => (Opcode::Close, close::encode_payload(close.as_ref())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}
