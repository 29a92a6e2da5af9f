use smtp_proto::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::metrics::{CipherLabels, Metrics, VersionLabels};
use crate::smtp::session::{BrokerSession, SessionReply, SessionState};
use crate::tls::{cipher_label, version_label};

const BUFFER_SIZE: usize = 4096;
const DATA_END: &[u8] = b"\r\n.\r\n";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept TLS: {0}")]
    Accept(std::io::Error),
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
    #[error("failed to write stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("upstream MTA failure: {0}")]
    Upstream(std::io::Error),
}

pub struct ConnectionContext {
    pub hostname: String,
    pub require_tls: bool,
    pub upstream: Option<SocketAddr>,
    pub handshake_timeout: Duration,
    pub acceptor: TlsAcceptor,
    pub metrics: Arc<Metrics>,
}

/// Drive one client connection through greeting, the STARTTLS upgrade, and
/// the relayed mail transaction.
pub async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    context: ConnectionContext,
) -> Result<(), ConnectionError> {
    let mut session = BrokerSession::new(&context.hostname, context.require_tls, peer);
    trace!("handling SMTP connection from {peer}");

    let mut stream = stream;
    write_reply(220, &format!("{} ESMTP", context.hostname), &mut stream).await?;

    match run_phase(&mut stream, &mut session, &context).await? {
        Phase::Closed => return Ok(()),
        Phase::Upgrade => {}
    }

    // STARTTLS accepted: 220 then the handshake, bounded by a deadline
    let (code, message) = session.ready_banner();
    write_reply(code, &message, &mut stream).await?;

    let handshake = context.acceptor.accept(stream);
    let mut tls_stream = match tokio::time::timeout(context.handshake_timeout, handshake).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            context.metrics.tls_handshake_errors.inc();
            return Err(ConnectionError::Accept(e));
        }
        Err(_) => {
            context.metrics.tls_handshake_errors.inc();
            return Err(ConnectionError::HandshakeTimeout);
        }
    };

    {
        let (_, connection) = tls_stream.get_ref();
        let version = version_label(connection.protocol_version());
        let cipher = cipher_label(connection.negotiated_cipher_suite().map(|s| s.suite()));
        info!(peer = %peer, version, cipher, "TLS established");
        context.metrics.tls_connections.inc();
        context
            .metrics
            .tls_version
            .get_or_create(&VersionLabels {
                version: version.to_string(),
            })
            .inc();
        context
            .metrics
            .tls_cipher_suite
            .get_or_create(&CipherLabels {
                cipher: cipher.to_string(),
            })
            .inc();
    }

    session.upgraded();
    match run_phase(&mut tls_stream, &mut session, &context).await? {
        Phase::Closed => {}
        // a second upgrade is refused inside the session; unreachable here
        Phase::Upgrade => debug!("ignoring repeated upgrade request from {peer}"),
    }
    tls_stream.shutdown().await.map_err(ConnectionError::Write)?;
    Ok(())
}

enum Phase {
    Closed,
    Upgrade,
}

async fn run_phase<S>(
    stream: &mut S,
    session: &mut BrokerSession,
    context: &ConnectionContext,
) -> Result<Phase, ConnectionError>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let (source, mut sink) = tokio::io::split(stream);
    let mut reader = BufReader::new(source);
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut relay: Option<Relay> = None;

    loop {
        read_line(&mut reader, &mut buffer).await?;
        let request = Request::parse(&mut buffer.iter()).map(Request::into_owned);

        match session.handle(request, &buffer) {
            SessionReply::Reply(code, message) => {
                write_reply(code, &message, &mut sink).await?;
            }
            SessionReply::Closing(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(Phase::Closed);
            }
            SessionReply::RawReply(raw) => {
                sink.write_all(&raw).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::StartUpgrade => return Ok(Phase::Upgrade),
            SessionReply::Relay(line) => {
                let Some(upstream_addr) = context.upstream else {
                    write_reply(451, "4.3.2 No upstream configured", &mut sink).await?;
                    continue;
                };
                if relay.is_none() {
                    relay = Some(Relay::connect(upstream_addr, session.state()).await?);
                }
                let relay = relay.as_mut().expect("relay connected above");

                let reply = relay.exchange(&line).await?;
                sink.write_all(&reply).await.map_err(ConnectionError::Write)?;

                // 354 means the MTA wants message data: pass it through
                // verbatim until the end-of-data marker
                if reply.starts_with(b"354") {
                    let reply = relay.pass_data(&mut reader).await?;
                    sink.write_all(&reply).await.map_err(ConnectionError::Write)?;
                }
            }
        }
    }
}

/// Command-level relay to the upstream MTA. The greeting and an EHLO
/// exchange happen at connect so the upstream is in the same protocol
/// state as the client session.
struct Relay {
    stream: BufReader<TcpStream>,
}

impl Relay {
    async fn connect(addr: SocketAddr, state: SessionState) -> Result<Relay, ConnectionError> {
        debug!("connecting to upstream MTA at {addr} (session {state:?})");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ConnectionError::Upstream)?;
        let mut relay = Relay {
            stream: BufReader::new(stream),
        };

        relay.read_reply().await?;
        let greeting = b"EHLO mailgate.relay\r\n";
        relay
            .stream
            .get_mut()
            .write_all(greeting)
            .await
            .map_err(ConnectionError::Upstream)?;
        relay.read_reply().await?;
        Ok(relay)
    }

    async fn exchange(&mut self, line: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.stream
            .get_mut()
            .write_all(line)
            .await
            .map_err(ConnectionError::Upstream)?;
        self.read_reply().await
    }

    /// Read one (possibly multiline) SMTP reply.
    async fn read_reply(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut reply = Vec::new();
        loop {
            let mut line = Vec::with_capacity(128);
            let n = self
                .stream
                .read_until(b'\n', &mut line)
                .await
                .map_err(ConnectionError::Upstream)?;
            if n == 0 {
                return Err(ConnectionError::Dropped);
            }
            let last = line.len() >= 4 && line[3] == b' ';
            reply.extend_from_slice(&line);
            if last || line.len() < 4 {
                return Ok(reply);
            }
        }
    }

    /// Copy message data client→upstream until `CRLF.CRLF`, then return the
    /// MTA's verdict.
    async fn pass_data<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, ConnectionError>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mut window: Vec<u8> = Vec::new();
        let mut chunk = [0u8; BUFFER_SIZE];
        loop {
            let n = reader.read(&mut chunk).await.map_err(ConnectionError::Read)?;
            if n == 0 {
                return Err(ConnectionError::Dropped);
            }
            self.stream
                .get_mut()
                .write_all(&chunk[..n])
                .await
                .map_err(ConnectionError::Upstream)?;

            window.extend_from_slice(&chunk[..n]);
            if window.len() > DATA_END.len() {
                let excess = window.len() - DATA_END.len();
                window.drain(..excess);
            }
            if window == DATA_END {
                return self.read_reply().await;
            }
        }
    }
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    trace!("sent: {code} {message}");
    sink.write_all(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)
}
