use anyhow::{Context, Result};
use cobaltite::{
    deflate::PerMessageDeflate, reconnect::FixedDelay, ClientConfig, ClientManager, CloseCode,
    Credentials, Message, TcpTransport, Transport,
};
use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_rustls::{
    client::TlsStream,
    rustls::{pki_types::ServerName, ClientConfig as TlsConfig, RootCertStore},
    TlsConnector,
};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(argh::FromArgs)]
#[argh(description = "client example")]
struct Args {
    #[argh(option, description = "ws:// or wss:// URL to connect to")]
    request: String,

    #[argh(option, description = "domain (CN) of the remote host")]
    domain: Option<String>,

    #[argh(option, description = "ca certificate")]
    ca: Option<PathBuf>,

    #[argh(option, description = "text message to send after connecting")]
    send: Option<String>,

    #[argh(option, description = "username for HTTP authentication")]
    user: Option<String>,

    #[argh(option, description = "password for HTTP authentication")]
    password: Option<String>,

    #[argh(option, description = "subprotocol to offer")]
    protocol: Vec<String>,

    #[argh(switch, description = "follow redirects")]
    redirect: bool,

    #[argh(switch, description = "retry when the server answers 503 with Retry-After")]
    retry_after: bool,

    #[argh(option, description = "reconnect this many times after connection failures")]
    retries: Option<u32>,

    #[argh(switch, description = "offer permessage-deflate")]
    deflate: bool,
}

struct TlsTransport {
    connector: TlsConnector,
    domain: Option<String>,
}

impl Transport for TlsTransport {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self, url: &Url) -> Result<Self::Stream, cobaltite::Error> {
        if url.scheme() != "wss" {
            return Err(cobaltite::Error::IncorrectScheme(url.scheme().into()));
        }
        let host = url.host_str().ok_or(cobaltite::Error::NoHost)?;
        let port = url.port_or_known_default().unwrap_or(443);
        let name = ServerName::try_from(self.domain.clone().unwrap_or_else(|| host.to_string()))
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

        let tcp_stream = TcpStream::connect((host, port)).await?;
        Ok(self.connector.connect(name, tcp_stream).await?)
    }

    fn release(&self) {
        tracing::debug!("tls transport idle");
    }
}

fn tls_connector(ca: Option<&PathBuf>) -> Result<TlsConnector> {
    let mut root_cert_store = RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca) = ca {
        let ca_file = File::open(ca).context("read ca file")?;
        let mut buf_reader = BufReader::new(ca_file);
        rustls_pemfile::certs(&mut buf_reader)
            .collect::<Result<Vec<_>, _>>()
            .context("read certs from CA")?
            .into_iter()
            .map(|cert| root_cert_store.add(cert))
            .collect::<Result<Vec<_>, _>>()
            .context("add certs to root store")?;
    }

    let config = TlsConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn run<T: Transport>(manager: ClientManager<T>, url: &str, send: Option<String>) -> Result<()> {
    let mut ws = manager.connect(url).await?;
    println!(
        "connected, subprotocol {:?}, extensions {:?}",
        ws.subprotocol(),
        ws.extensions().names().collect::<Vec<_>>()
    );

    if let Some(text) = send {
        ws.write(Message::Text(text)).await?;
        ws.flush().await?;
    }

    loop {
        tokio::select! {
            message = ws.read() => match message {
                Ok(message) => println!("server sent: {:?}", message),
                Err(err) if err.closed_normally() => {
                    println!("closed normally");
                    break;
                }
                Err(err) => anyhow::bail!(err),
            },

            _ = tokio::signal::ctrl_c() => {
                ws.close(CloseCode::Normal, "bye").await?;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Args = argh::from_env();
    let url = Url::parse(&args.request).context("parse url")?;

    let mut config = ClientConfig::default()
        .redirect_enabled(args.redirect)
        .retry_after_enabled(args.retry_after)
        .log_upgrade_messages(true);
    for protocol in args.protocol {
        config = config.subprotocol(protocol);
    }
    if let Some(user) = args.user {
        config = config.credentials(Credentials::new(user, args.password.unwrap_or_default()));
    }
    if let Some(retries) = args.retries {
        config = config.reconnect_policy(Arc::new(FixedDelay::new(
            Duration::from_secs(1),
            Some(retries),
        )));
    }
    if args.deflate {
        config = config.extension(Arc::new(PerMessageDeflate::default()));
    }

    if url.scheme() == "wss" {
        let transport = TlsTransport {
            connector: tls_connector(args.ca.as_ref())?,
            domain: args.domain,
        };
        run(ClientManager::with_transport(transport, config), url.as_str(), args.send).await
    } else {
        run(ClientManager::with_transport(TcpTransport, config), url.as_str(), args.send).await
    }
}
