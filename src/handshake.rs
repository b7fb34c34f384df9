use crate::{Error, HandshakeError, Utf8Error};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1_smol::Sha1;
use std::fmt::{self, Write as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use url::Url;

pub const SWITCHING_PROTOCOLS: u16 = 101;
pub const SEC_WEBSOCKET_ACCEPT_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_VERSION: &str = "13";

pub const HOST: &str = "Host";
pub const ORIGIN: &str = "Origin";
pub const UPGRADE: &str = "Upgrade";
pub const CONNECTION: &str = "Connection";
pub const AUTHORIZATION: &str = "Authorization";
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const LOCATION: &str = "Location";
pub const RETRY_AFTER: &str = "Retry-After";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";

/// HTTP header fields in arrival order. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of `name` with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields
            .retain(|(field, _)| !field.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Whether the comma-separated header `name` contains `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }
}

/// An HTTP/1.1 upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub url: Url,
    pub headers: Headers,
}

impl UpgradeRequest {
    pub fn secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    pub fn resource_name(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().into(),
        }
    }

    /// Recomputes `Host` and `Origin` from the request URL.
    pub fn update_host_and_origin(&mut self) -> Result<(), Error> {
        let host = host_header(&self.url)?;
        let origin = format!(
            "{}://{}",
            if self.secure() { "https" } else { "http" },
            host
        );
        self.headers.insert(HOST, host);
        self.headers.insert(ORIGIN, origin);
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for UpgradeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GET {} HTTP/1.1\r\n", self.resource_name())?;
        for (name, value) in self.headers.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        f.write_str("\r\n")
    }
}

/// Status line and headers of the server's answer. The body is never read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl UpgradeResponse {
    pub fn new(status: u16) -> Self {
        UpgradeResponse {
            status,
            reason: String::new(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }
}

impl fmt::Display for UpgradeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/1.1 {} {}\r\n", self.status, self.reason)?;
        for (name, value) in self.headers.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        f.write_str("\r\n")
    }
}

/// `Host` header value: the host, plus the port when it is not the scheme's default.
pub fn host_header(url: &Url) -> Result<String, Error> {
    let host = url.host_str().ok_or(Error::NoHost)?;
    let mut value = String::from(host);
    if let Some(port) = url.port() {
        let _ = write!(value, ":{}", port);
    }
    Ok(value)
}

pub fn generate_key() -> Result<String, Error> {
    let mut key_bytes = [0u8; 16];
    getrandom::getrandom(&mut key_bytes)?;
    Ok(BASE64.encode(key_bytes))
}

pub fn accept_key(key_base64: &str) -> String {
    let accept_bytes = Sha1::from(format!("{}{}", key_base64, SEC_WEBSOCKET_ACCEPT_UUID))
        .digest()
        .bytes();
    BASE64.encode(accept_bytes)
}

struct CodepointReceiver {
    string: String,
    valid: bool,
}

impl utf8parse::Receiver for CodepointReceiver {
    fn codepoint(&mut self, c: char) {
        self.string.push(c);
    }

    fn invalid_sequence(&mut self) {
        self.valid = false;
    }
}

async fn read_utf8_until(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    max_len: usize,
    until: &'static str,
) -> Result<String, Error> {
    let mut parser = utf8parse::Parser::new();
    let mut receiver = CodepointReceiver {
        valid: true,
        string: String::new(),
    };

    loop {
        let byte = stream.read_u8().await?;
        parser.advance(&mut receiver, byte);
        if !receiver.valid {
            return Err(Error::Utf8(Utf8Error::Handshake));
        }
        if receiver.string.ends_with(until) {
            break;
        }
        if receiver.string.len() > max_len {
            return Err(HandshakeError::HeadersTooLong(max_len).into());
        }
    }

    Ok(receiver.string)
}

fn parse_headers(headers_str: &str) -> Result<Headers, Error> {
    let mut headers = Headers::new();

    for line in headers_str.lines() {
        if line.is_empty() {
            break;
        }

        let Some((header, value)) = line.split_once(':') else {
            return Err(HandshakeError::MissingOrInvalidHeader(line.into()).into());
        };

        headers.append(header.trim(), value.trim());
    }

    Ok(headers)
}

fn parse_status_line(line: &str) -> Result<(u16, String), Error> {
    let mut split = line.trim().splitn(3, ' ');
    let (Some(version), Some(status)) = (split.next(), split.next()) else {
        return Err(HandshakeError::UnexpectedResponse(line.into()).into());
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::UnexpectedResponse(line.into()).into());
    }
    let status = status
        .parse()
        .map_err(|_| HandshakeError::UnexpectedResponse(line.into()))?;
    Ok((status, split.next().unwrap_or_default().into()))
}

pub async fn write_request(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    request: &UpgradeRequest,
) -> Result<(), Error> {
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a status line and headers, leaving anything after the blank line in the stream's
/// buffer.
pub async fn read_response(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    max_len: usize,
) -> Result<UpgradeResponse, Error> {
    let status_line = read_utf8_until(stream, max_len, "\n").await?;
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers_str = String::new();
    loop {
        let remaining = max_len.saturating_sub(headers_str.len());
        let line = read_utf8_until(stream, remaining, "\n")
            .await
            .map_err(|err| match err {
                Error::Handshake(HandshakeError::HeadersTooLong(_)) => {
                    HandshakeError::HeadersTooLong(max_len).into()
                }
                err => err,
            })?;
        if line.trim_end().is_empty() {
            break;
        }
        headers_str.push_str(&line);
    }
    let headers = parse_headers(&headers_str)?;

    Ok(UpgradeResponse {
        status,
        reason,
        headers,
    })
}

/// Discards the body of a response so the next request can be written to the same stream.
///
/// Only a `Content-Length` body can be skipped. A response that closes the connection or whose
/// body length is unknown fails with [`HandshakeError::UnskippableBody`].
pub async fn skip_body(
    stream: &mut BufStream<impl AsyncRead + AsyncWrite + Unpin>,
    response: &UpgradeResponse,
) -> Result<(), Error> {
    let headers = &response.headers;
    if headers.has_token(CONNECTION, "close") {
        return Err(HandshakeError::UnskippableBody("server is closing the connection").into());
    }
    if headers.contains(TRANSFER_ENCODING) {
        return Err(HandshakeError::UnskippableBody("body has a transfer encoding").into());
    }
    let Some(length) = headers.get(CONTENT_LENGTH) else {
        return Err(HandshakeError::UnskippableBody("body length is unknown").into());
    };
    let length: u64 = length
        .trim()
        .parse()
        .map_err(|_| HandshakeError::MissingOrInvalidHeader(CONTENT_LENGTH.into()))?;

    let skipped = tokio::io::copy(&mut (&mut *stream).take(length), &mut tokio::io::sink()).await?;
    if skipped < length {
        return Err(tokio::io::Error::from(tokio::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn host_includes_only_non_default_ports() {
        let url = Url::parse("ws://example.com:80/chat").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com");
        let url = Url::parse("wss://example.com:8443/chat").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com:8443");
    }

    #[test]
    fn request_serializes_resource_and_headers() {
        let mut request = UpgradeRequest {
            url: Url::parse("ws://example.com/chat?room=1").unwrap(),
            headers: Headers::new(),
        };
        request.update_host_and_origin().unwrap();
        request.headers.append(UPGRADE, "websocket");
        assert_eq!(
            request.to_string(),
            "GET /chat?room=1 HTTP/1.1\r\nHost: example.com\r\nOrigin: http://example.com\r\n\
             Upgrade: websocket\r\n\r\n"
        );
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("connection", "keep-alive, Upgrade");
        headers.append("X-Multi", "a");
        headers.append("x-multi", "b");
        assert!(headers.has_token(CONNECTION, "upgrade"));
        assert_eq!(headers.get_all("X-MULTI").collect::<Vec<_>>(), vec!["a", "b"]);
        headers.insert("X-Multi", "c");
        assert_eq!(headers.get_all("x-multi").collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn parses_status_lines() {
        assert_eq!(
            parse_status_line("HTTP/1.1 101 Switching Protocols\r\n").unwrap(),
            (101, "Switching Protocols".into())
        );
        assert_eq!(parse_status_line("HTTP/1.0 503\r\n").unwrap(), (503, "".into()));
        assert!(parse_status_line("SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[tokio::test]
    async fn reads_a_response_and_keeps_trailing_bytes() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 302 Found\r\nLocation: /next\r\nX-A: 1\r\n\r\n\x81\x00")
            .await
            .unwrap();

        let mut stream = BufStream::new(client);
        let response = read_response(&mut stream, 8192).await.unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(response.headers.get("location"), Some("/next"));

        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0x81, 0x00]);
    }

    #[tokio::test]
    async fn skips_a_content_length_body() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 5\r\n\r\nnope!HTTP")
            .await
            .unwrap();

        let mut stream = BufStream::new(client);
        let response = read_response(&mut stream, 8192).await.unwrap();
        skip_body(&mut stream, &response).await.unwrap();

        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"HTTP");
    }

    #[tokio::test]
    async fn bodies_of_unknown_length_cannot_be_skipped() {
        for head in [
            "HTTP/1.1 302 Found\r\nLocation: /next\r\n\r\n",
            "HTTP/1.1 401 Unauthorized\r\nTransfer-Encoding: chunked\r\n\r\n",
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ] {
            let (client, mut server) = tokio::io::duplex(1024);
            server.write_all(head.as_bytes()).await.unwrap();

            let mut stream = BufStream::new(client);
            let response = read_response(&mut stream, 8192).await.unwrap();
            let err = skip_body(&mut stream, &response).await.unwrap_err();
            assert!(
                matches!(err, Error::Handshake(HandshakeError::UnskippableBody(_))),
                "{head:?}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 50\r\n\r\nshort")
            .await
            .unwrap();
        drop(server);

        let mut stream = BufStream::new(client);
        let response = read_response(&mut stream, 8192).await.unwrap();
        assert!(matches!(
            skip_body(&mut stream, &response).await,
            Err(Error::TokioIo(_))
        ));
    }

    #[tokio::test]
    async fn oversized_headers_are_rejected() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut response = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
        response.extend(std::iter::repeat(b'a').take(200));
        server.write_all(&response).await.unwrap();

        let mut stream = BufStream::new(client);
        let err = read_response(&mut stream, 64).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::HeadersTooLong(64))
        ));
    }
}
