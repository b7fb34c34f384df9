use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use cobaltite::{
    frame::FrameCodec,
    handshake::{accept_key, SEC_WEBSOCKET_KEY},
    reassemble::Reassembler,
    Frame, Message, Opcode,
};
use std::net::ToSocketAddrs;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(argh::FromArgs)]
#[argh(description = "echo server example")]
struct Args {
    #[argh(option, description = "address to bind to")]
    bind: String,
}

async fn handshake(stream: &mut TcpStream) -> Result<()> {
    let mut request = Vec::<u8>::new();
    while !request.ends_with(b"\r\n\r\n") {
        request.push(stream.read_u8().await.context("read request")?);
    }
    let request = std::str::from_utf8(&request).context("request utf8")?;

    let key = request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case(SEC_WEBSOCKET_KEY)
                .then(|| value.trim())
        })
        .ok_or_else(|| anyhow!("no websocket key"))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn handle(mut stream: TcpStream) -> Result<()> {
    handshake(&mut stream).await?;

    let codec = FrameCodec::server(1 << 20);
    let mut reassembler = Reassembler::new(1 << 24);
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let Some(frame) = codec.unframe(&mut buffer)? else {
            if stream.read_buf(&mut buffer).await? == 0 {
                return Ok(());
            }
            continue;
        };

        let reply = match reassembler.push(frame)? {
            None | Some(Message::Pong(_)) => continue,
            Some(Message::Text(text)) => Frame::new(Opcode::Text, text.into_bytes()),
            Some(Message::Binary(data)) => Frame::new(Opcode::Binary, data),
            Some(Message::Ping(data)) => Frame::new(Opcode::Pong, data),
            Some(Message::Close(close)) => {
                info!(?close, "client closed");
                let payload = close
                    .map(|close| u16::from(close.code).to_be_bytes().to_vec())
                    .unwrap_or_default();
                stream
                    .write_all(&codec.frame(&Frame::new(Opcode::Close, payload))?)
                    .await?;
                return Ok(());
            }
        };
        stream.write_all(&codec.frame(&reply)?).await?;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Args = argh::from_env();
    let addr = args
        .bind
        .to_socket_addrs()
        .context("to socket address")?
        .next()
        .ok_or_else(|| anyhow!("to socket address"))?;

    let listener = TcpListener::bind(addr).await.context("bind")?;
    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept")?;
        info!(%peer_addr, "new client");
        tokio::spawn(async move {
            if let Err(err) = handle(stream).await {
                warn!(%peer_addr, "{:?}", err);
            }
        });
    }
}
