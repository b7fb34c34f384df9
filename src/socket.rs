use crate::{
    buffer,
    client::ActivityGuard,
    close,
    config::ClientConfig,
    engine::{ClientEngine, UpgradeOutcome, Upgraded},
    extension::NegotiatedExtensions,
    frame::FrameCodec,
    handshake,
    reassemble::Reassembler,
    Close, CloseCode, Error, Frame, Message, Opcode, ProtocolError, RedirectError,
};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, trace, warn};
use url::Url;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// We sent a close frame and wait for the peer's.
    CloseSent,
    Closed,
}

/// An open client connection.
///
/// Incoming bytes go through the input buffer, the frame codec, the negotiated extensions and
/// the reassembler, in that order. Outgoing messages take the reverse path.
pub struct WebSocket<Stream> {
    stream: BufStream<Stream>,
    buffer: BytesMut,
    scratch: Box<[u8]>,
    codec: FrameCodec,
    reassembler: Reassembler,
    extensions: NegotiatedExtensions,
    subprotocol: Option<String>,
    secure: bool,
    state: SessionState,
    incoming_buffer_size: usize,
    buffer_step_size: usize,
    auto_pong: bool,
    activity: Option<ActivityGuard>,
}

impl<Stream> std::fmt::Debug for WebSocket<Stream> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("state", &self.state)
            .field("subprotocol", &self.subprotocol)
            .field("extensions", &self.extensions)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<Stream> WebSocket<Stream>
where
    Stream: AsyncRead + AsyncWrite + Unpin,
{
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn extensions(&self) -> &NegotiatedExtensions {
        &self.extensions
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Runs the upgrade handshake over `stream` and opens the session.
    ///
    /// Every request, including ones after a redirect or an auth challenge, is written to the
    /// same stream, so the body of each intermediate response must carry a `Content-Length` and
    /// redirects must stay on the same host. [`crate::ClientManager`] opens a fresh connection
    /// per request instead.
    pub async fn client_from_stream(
        url: Url,
        stream: Stream,
        config: Arc<ClientConfig>,
    ) -> Result<Self, Error> {
        let mut engine = ClientEngine::new(url, Arc::clone(&config))?;
        let mut stream = BufStream::new(stream);
        let upgraded = upgrade_within(&mut engine, &mut stream, &config).await?;

        let secure = engine.current_url().scheme() == "wss";
        Ok(WebSocket::from_upgrade(stream, upgraded, &config, secure))
    }

    pub(crate) fn from_upgrade(
        stream: BufStream<Stream>,
        upgraded: Upgraded,
        config: &ClientConfig,
        secure: bool,
    ) -> Self {
        let mut codec = FrameCodec::client(
            config.incoming_buffer_size,
            Arc::clone(&config.masking_key_generator),
        );
        for bit in upgraded.extensions.reserved_bits() {
            codec.claim_reserved_bit(bit);
        }

        WebSocket {
            stream,
            buffer: BytesMut::new(),
            scratch: vec![0; READ_CHUNK].into_boxed_slice(),
            codec,
            reassembler: Reassembler::new(config.incoming_buffer_size),
            extensions: upgraded.extensions,
            subprotocol: upgraded.subprotocol,
            secure,
            state: SessionState::Open,
            incoming_buffer_size: config.incoming_buffer_size,
            buffer_step_size: config.buffer_step_size,
            auto_pong: config.auto_pong,
            activity: None,
        }
    }

    /// Counts this session as active until it closes or is dropped.
    pub(crate) fn with_activity(mut self, guard: ActivityGuard) -> Self {
        self.activity = Some(guard);
        self
    }

    fn set_closed(&mut self) {
        self.state = SessionState::Closed;
        self.extensions.destroy();
        self.activity = None;
    }

    /// Reads the next message.
    ///
    /// Pings and pongs are returned as messages. A close frame from the peer is answered and
    /// then returned as [`Error::Closed`]. Protocol violations close the connection with the
    /// matching close code before the error is returned.
    pub async fn read(&mut self) -> Result<Message, Error> {
        if self.state == SessionState::Closed {
            return Err(Error::WasClosed);
        }

        loop {
            if let Some(message) = self.next_buffered().await? {
                return Ok(message);
            }
            if self.read_bytes().await? == 0 {
                self.set_closed();
                return Err(Error::Closed(None));
            }
        }
    }

    /// Moves whatever the transport has into the input buffer. Returns 0 at end of stream.
    ///
    /// Cancel safe: if the future is dropped no bytes are lost.
    pub async fn read_bytes(&mut self) -> Result<usize, Error> {
        let read = match self.stream.read(&mut self.scratch).await {
            Ok(read) => read,
            Err(err) => return Err(self.fail(err.into()).await),
        };
        trace!(read, buffered = self.buffer.len(), "read from transport");

        if let Err(err) = buffer::append(
            &mut self.buffer,
            &self.scratch[..read],
            self.incoming_buffer_size,
            self.buffer_step_size,
        ) {
            return Err(self.fail(err).await);
        }
        Ok(read)
    }

    /// Processes frames already in the input buffer until a message is complete.
    pub async fn next_buffered(&mut self) -> Result<Option<Message>, Error> {
        if self.state == SessionState::Closed {
            return Err(Error::WasClosed);
        }

        loop {
            let frame = match self.codec.unframe(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(err) => return Err(self.fail(err).await),
            };
            trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");

            let frame = match self.extensions.incoming(frame) {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err).await),
            };
            let message = match self.reassembler.push(frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => return Err(self.fail(err).await),
            };

            match message {
                Message::Ping(payload) => {
                    if self.auto_pong && self.state == SessionState::Open {
                        self.write_frame(Frame::new(Opcode::Pong, payload.clone()))
                            .await?;
                        self.flush().await?;
                    }
                    return Ok(Some(Message::Ping(payload)));
                }
                Message::Close(close) => {
                    self.on_close(close.as_ref()).await;
                    return Err(Error::Closed(close));
                }
                message => return Ok(Some(message)),
            }
        }
    }

    // The session is closed afterwards even if the echo cannot be delivered.
    async fn on_close(&mut self, close: Option<&Close>) {
        debug!(?close, "received close");
        if self.state == SessionState::Open {
            let frame = Frame::new(Opcode::Close, close::encode_payload(close));
            if let Err(write_err) = self.send_frame(frame).await {
                debug!(%write_err, "could not echo close frame");
            } else if let Err(flush_err) = self.flush().await {
                debug!(%flush_err, "could not flush close frame");
            }
        }
        self.set_closed();
    }

    /// Closes after a protocol error, telling the peer why when the error is its fault.
    async fn fail(&mut self, err: Error) -> Error {
        let closable = matches!(
            err,
            Error::Protocol(_) | Error::BufferOverflow { .. } | Error::Utf8(_)
        );
        if closable && self.state == SessionState::Open {
            let close = Close {
                code: err.close_code(),
                reason: String::new(),
            };
            warn!(%err, code = u16::from(close.code), "closing connection");
            let frame = Frame::new(Opcode::Close, close::encode_payload(Some(&close)));
            if let Err(write_err) = self.send_frame(frame).await {
                debug!(%write_err, "could not send close frame");
            } else if let Err(flush_err) = self.flush().await {
                debug!(%flush_err, "could not flush close frame");
            }
        }

        self.set_closed();
        err
    }

    pub async fn write(&mut self, message: Message) -> Result<(), Error> {
        let (opcode, payload) = message.into_opcode_payload();
        self.write_frame(Frame::new(opcode, payload)).await
    }

    /// Writes one frame, for callers that fragment messages themselves.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.state != SessionState::Open {
            return Err(Error::WasClosed);
        }
        if frame.opcode == Opcode::Close {
            self.state = SessionState::CloseSent;
        }
        self.send_frame(frame).await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let frame = self.extensions.outgoing(frame)?;
        let bytes = self.codec.frame(&frame)?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Starts the closing handshake. Keep reading to receive the peer's close.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), Error> {
        if !code.is_allowed() {
            return Err(ProtocolError::InvalidCloseCode(code.into()).into());
        }
        self.write(Message::Close(Some(Close {
            code,
            reason: reason.into(),
        })))
        .await?;
        self.flush().await
    }
}

/// Runs [`upgrade`] under the configured handshake timeout. A timeout fails the engine.
async fn upgrade_within<S: AsyncRead + AsyncWrite + Unpin>(
    engine: &mut ClientEngine,
    stream: &mut BufStream<S>,
    config: &ClientConfig,
) -> Result<Upgraded, Error> {
    let timeout = config.handshake_timeout;
    match tokio::time::timeout(timeout, upgrade(engine, stream, config.max_header_len)).await {
        Ok(upgraded) => upgraded,
        Err(_) => Err(engine.process_error(Error::Timeout(timeout))),
    }
}

async fn upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    engine: &mut ClientEngine,
    stream: &mut BufStream<S>,
    max_header_len: usize,
) -> Result<Upgraded, Error> {
    let origin = engine.current_url().origin();
    loop {
        let request = engine.create_upgrade_request()?;
        let response = match exchange(stream, &request, max_header_len).await {
            Ok(response) => response,
            Err(err) => return Err(engine.process_error(err)),
        };
        match engine.process_response(&response)? {
            UpgradeOutcome::Success(upgraded) => return Ok(upgraded),
            UpgradeOutcome::AnotherRequestRequired => {}
        }

        if engine.current_url().origin() != origin {
            let err = RedirectError::OtherHost {
                status: response.status,
                location: engine.current_url().to_string(),
            };
            return Err(engine.process_error(err.into()));
        }
        if let Err(err) = handshake::skip_body(stream, &response).await {
            return Err(engine.process_error(err));
        }
    }
}

/// Sends one upgrade request and reads the answer.
pub(crate) async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufStream<S>,
    request: &handshake::UpgradeRequest,
    max_header_len: usize,
) -> Result<handshake::UpgradeResponse, Error> {
    handshake::write_request(stream, request).await?;
    handshake::read_response(stream, max_header_len).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deflate::PerMessageDeflate,
        engine::HandshakeState,
        extension::{negotiate, parse_header, Extension},
        frame::FrameCodec,
        handshake::{accept_key, UpgradeResponse, SEC_WEBSOCKET_KEY},
        mask::{mask_payload, FixedMaskingKey},
        Credentials, HandshakeError,
    };
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut request = Vec::new();
        while !request.ends_with(b"\r\n\r\n") {
            request.push(server.read_u8().await.unwrap());
        }
        String::from_utf8(request).unwrap()
    }

    fn switching_protocols(request: &str) -> UpgradeResponse {
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix(&format!("{}: ", SEC_WEBSOCKET_KEY)))
            .unwrap();
        UpgradeResponse::new(101)
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Accept", &accept_key(key))
    }

    /// Reads one upgrade request off `server` and answers it with 101.
    async fn accept(server: &mut DuplexStream) {
        let request = read_request(server).await;
        let response = switching_protocols(&request);
        server
            .write_all(response.to_string().as_bytes())
            .await
            .unwrap();
    }

    async fn open(config: ClientConfig) -> (WebSocket<DuplexStream>, DuplexStream) {
        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let (ws, ()) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            accept(&mut server)
        );
        (ws.unwrap(), server)
    }

    /// Answers the first request with `first`, then upgrades the second.
    async fn answer_then_accept(server: &mut DuplexStream, first: &str) -> String {
        read_request(server).await;
        server.write_all(first.as_bytes()).await.unwrap();
        let retry = read_request(server).await;
        let response = switching_protocols(&retry);
        server
            .write_all(response.to_string().as_bytes())
            .await
            .unwrap();
        retry
    }

    fn server_frame(frame: &Frame) -> Vec<u8> {
        FrameCodec::server(usize::MAX).frame(frame).unwrap()
    }

    async fn read_client_frame(server: &mut DuplexStream) -> Frame {
        let codec = FrameCodec::server(usize::MAX);
        let mut buffer = BytesMut::new();
        loop {
            if let Some(frame) = codec.unframe(&mut buffer).unwrap() {
                return frame;
            }
            server.read_buf(&mut buffer).await.unwrap();
        }
    }

    #[tokio::test]
    async fn ping_between_fragments() {
        let (mut ws, mut server) = open(ClientConfig::default()).await;

        let mut wire = Vec::new();
        wire.extend(server_frame(&Frame::new(Opcode::Text, b"ab".to_vec()).with_fin(false)));
        wire.extend(server_frame(&Frame::new(Opcode::Continuation, b"c".to_vec()).with_fin(false)));
        wire.extend(server_frame(&Frame::new(Opcode::Ping, b"p".to_vec())));
        wire.extend(server_frame(&Frame::new(Opcode::Continuation, b"d".to_vec())));
        // one byte at a time
        for byte in wire {
            server.write_u8(byte).await.unwrap();
        }

        assert_eq!(ws.read().await.unwrap(), Message::Ping(b"p".to_vec()));
        assert_eq!(ws.read().await.unwrap(), Message::Text("abcd".into()));

        let pong = read_client_frame(&mut server).await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"p");
    }

    #[tokio::test]
    async fn frames_are_masked_with_the_configured_key() {
        let key = 0x1234_5678;
        let config = ClientConfig::default().masking_key_generator(Arc::new(FixedMaskingKey(key)));
        let (mut ws, mut server) = open(config).await;

        ws.write(Message::Binary(vec![1, 2, 3, 4, 5])).await.unwrap();
        ws.flush().await.unwrap();

        let mut wire = [0u8; 2 + 4 + 5];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0x82);
        assert_eq!(wire[1], 0x80 | 5);
        assert_eq!(u32::from_be_bytes([wire[2], wire[3], wire[4], wire[5]]), key);
        let mut payload = wire[6..].to_vec();
        mask_payload(&mut payload, key);
        assert_eq!(payload, [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn peer_close_is_echoed() {
        let (mut ws, mut server) = open(ClientConfig::default()).await;
        let close = Close {
            code: CloseCode::Away,
            reason: "bye".into(),
        };
        server
            .write_all(&server_frame(&Frame::new(
                Opcode::Close,
                close::encode_payload(Some(&close)),
            )))
            .await
            .unwrap();

        let err = ws.read().await.unwrap_err();
        assert!(matches!(&err, Error::Closed(Some(got)) if *got == close));
        assert!(ws.is_closed());

        let echo = read_client_frame(&mut server).await;
        assert_eq!(echo.opcode, Opcode::Close);
        assert_eq!(close::decode_payload(&echo.payload).unwrap(), Some(close));

        assert!(matches!(ws.read().await, Err(Error::WasClosed)));
        assert!(matches!(
            ws.write(Message::Text("late".into())).await,
            Err(Error::WasClosed)
        ));
    }

    #[tokio::test]
    async fn client_close_waits_for_the_peer() {
        let (mut ws, mut server) = open(ClientConfig::default()).await;
        ws.close(CloseCode::Normal, "done").await.unwrap();
        assert_eq!(ws.state(), SessionState::CloseSent);

        let sent = read_client_frame(&mut server).await;
        assert_eq!(sent.opcode, Opcode::Close);
        server.write_all(&server_frame(&sent_back(sent))).await.unwrap();

        let err = ws.read().await.unwrap_err();
        assert!(err.closed_normally());
        assert!(ws.is_closed());
    }

    fn sent_back(frame: Frame) -> Frame {
        Frame::new(frame.opcode, frame.payload)
    }

    #[tokio::test]
    async fn oversized_message_closes_with_1009() {
        let config = ClientConfig::default().incoming_buffer_size(64);
        let (mut ws, mut server) = open(config).await;

        server
            .write_all(&server_frame(&Frame::new(Opcode::Binary, vec![0; 100])))
            .await
            .unwrap();

        let err = ws.read().await.unwrap_err();
        assert!(matches!(err, Error::BufferOverflow { .. }));

        let close = read_client_frame(&mut server).await;
        assert_eq!(
            close::decode_payload(&close.payload).unwrap().map(|c| c.code),
            Some(CloseCode::Size)
        );
    }

    #[tokio::test]
    async fn masked_server_frame_closes_with_1002() {
        let (mut ws, mut server) = open(ClientConfig::default()).await;
        let masked = FrameCodec::client(usize::MAX, Arc::new(FixedMaskingKey(7)))
            .frame(&Frame::new(Opcode::Text, b"hi".to_vec()))
            .unwrap();
        server.write_all(&masked).await.unwrap();

        assert!(matches!(
            ws.read().await,
            Err(Error::Protocol(ProtocolError::MaskedFrame))
        ));
        let close = read_client_frame(&mut server).await;
        assert_eq!(
            close::decode_payload(&close.payload).unwrap().map(|c| c.code),
            Some(CloseCode::Protocol)
        );
    }

    #[tokio::test]
    async fn close_is_final_even_if_the_echo_fails() {
        let (mut ws, mut server) = open(ClientConfig::default()).await;
        server
            .write_all(&server_frame(&Frame::new(Opcode::Close, Vec::new())))
            .await
            .unwrap();
        drop(server);

        assert!(matches!(ws.read().await, Err(Error::Closed(None))));
        assert!(ws.is_closed());
        assert!(matches!(ws.read().await, Err(Error::WasClosed)));
    }

    #[tokio::test]
    async fn inflated_message_over_the_limit_closes_with_1009() {
        let deflate: Arc<dyn Extension> = Arc::new(PerMessageDeflate::default());
        let config = ClientConfig::default()
            .extension(Arc::clone(&deflate))
            .incoming_buffer_size(1 << 16);

        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let handshake = async {
            let request = read_request(&mut server).await;
            assert!(request.contains("permessage-deflate"));
            let response = switching_protocols(&request)
                .with_header("Sec-WebSocket-Extensions", "permessage-deflate");
            server
                .write_all(response.to_string().as_bytes())
                .await
                .unwrap();
        };
        let (ws, ()) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            handshake
        );
        let mut ws = ws.unwrap();

        let mut compressor =
            negotiate(&parse_header(["permessage-deflate"]), &[deflate], usize::MAX).unwrap();
        let bomb = compressor
            .outgoing(Frame::new(Opcode::Binary, vec![0; 4 << 20]))
            .unwrap();
        assert!(bomb.payload.len() < 1 << 16);
        server.write_all(&server_frame(&bomb)).await.unwrap();

        assert!(matches!(
            ws.read().await,
            Err(Error::BufferOverflow { max, .. }) if max == 1 << 16
        ));
        let close = read_client_frame(&mut server).await;
        assert_eq!(
            close::decode_payload(&close.payload).unwrap().map(|c| c.code),
            Some(CloseCode::Size)
        );
    }

    #[tokio::test]
    async fn auth_challenge_body_is_skipped_before_retrying() {
        let config = ClientConfig::default().credentials(Credentials::new("user", "secret"));
        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let challenge = "HTTP/1.1 401 Unauthorized\r\n\
                         WWW-Authenticate: Basic realm=\"tests\"\r\n\
                         Content-Length: 5\r\n\r\nnope!";

        let (ws, retry) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            answer_then_accept(&mut server, challenge)
        );
        assert!(retry.starts_with("GET / HTTP/1.1\r\n"));
        assert!(retry.contains("Authorization: Basic "));
        let mut ws = ws.unwrap();

        server
            .write_all(&server_frame(&Frame::new(Opcode::Text, b"in".to_vec())))
            .await
            .unwrap();
        assert_eq!(ws.read().await.unwrap(), Message::Text("in".into()));
    }

    #[tokio::test]
    async fn auth_challenge_without_length_fails() {
        let config = ClientConfig::default().credentials(Credentials::new("user", "secret"));
        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let serve = async {
            read_request(&mut server).await;
            let challenge = "HTTP/1.1 401 Unauthorized\r\n\
                             WWW-Authenticate: Basic realm=\"tests\"\r\n\r\n";
            server.write_all(challenge.as_bytes()).await.unwrap();
        };

        let (ws, ()) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            serve
        );
        assert!(matches!(
            ws,
            Err(Error::Handshake(HandshakeError::UnskippableBody(_)))
        ));
    }

    #[tokio::test]
    async fn redirect_to_another_host_is_refused_on_one_stream() {
        let config = ClientConfig::default().redirect_enabled(true);
        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let serve = async {
            read_request(&mut server).await;
            let found = "HTTP/1.1 302 Found\r\nLocation: ws://elsewhere/\r\n\
                         Content-Length: 0\r\n\r\n";
            server.write_all(found.as_bytes()).await.unwrap();
        };

        let (ws, ()) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            serve
        );
        assert!(matches!(
            ws,
            Err(Error::Redirect(RedirectError::OtherHost { status: 302, .. }))
        ));
    }

    #[tokio::test]
    async fn same_host_redirect_reuses_the_stream() {
        let config = ClientConfig::default().redirect_enabled(true);
        let (client, mut server) = duplex(1 << 16);
        let url = Url::parse("ws://localhost/").unwrap();
        let moved = "HTTP/1.1 307 Temporary Redirect\r\nLocation: /moved\r\n\
                     Content-Length: 3\r\n\r\nbye";

        let (ws, retry) = tokio::join!(
            WebSocket::client_from_stream(url, client, Arc::new(config)),
            answer_then_accept(&mut server, moved)
        );
        assert!(retry.starts_with("GET /moved HTTP/1.1\r\n"));
        assert!(ws.is_ok());
    }

    #[tokio::test]
    async fn handshake_timeout_fails_the_engine() {
        let config = Arc::new(ClientConfig::default().handshake_timeout(Duration::from_millis(50)));
        let url = Url::parse("ws://localhost/").unwrap();
        let mut engine = ClientEngine::new(url, Arc::clone(&config)).unwrap();
        // the server never answers
        let (client, _server) = duplex(1 << 16);
        let mut stream = BufStream::new(client);

        let err = upgrade_within(&mut engine, &mut stream, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(timeout) if timeout == Duration::from_millis(50)));
        assert!(matches!(engine.state(), HandshakeState::Failed));
    }

    #[tokio::test]
    async fn end_of_stream_is_an_abnormal_close() {
        let (mut ws, server) = open(ClientConfig::default()).await;
        drop(server);
        assert!(matches!(ws.read().await, Err(Error::Closed(None))));
    }
}
