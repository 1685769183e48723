use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::Mutex,
};

use crate::error::SessionError;

pub mod slip;

use slip::SlipReader;

const MAX_DATAGRAM: usize = 65_536;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

enum Writer {
    Datagram(Arc<UdpSocket>),
    Stream(Mutex<BoxedWriter>),
}

/// Shared output path. Cloning is cheap; every clone writes through the
/// same lock so stream frames never interleave.
#[derive(Clone)]
pub struct FrameSender {
    writer: Arc<Writer>,
}

impl FrameSender {
    pub fn datagram(socket: Arc<UdpSocket>) -> Self {
        Self {
            writer: Arc::new(Writer::Datagram(socket)),
        }
    }

    pub fn stream(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Writer::Stream(Mutex::new(Box::new(writer)))),
        }
    }

    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        match self.writer.as_ref() {
            Writer::Datagram(socket) => {
                socket.send(payload).await?;
            }
            Writer::Stream(writer) => {
                let framed = slip::encode(payload);
                let mut writer = writer.lock().await;
                writer.write_all(&framed).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }
}

pub enum FrameReceiver {
    Datagram {
        socket: Arc<UdpSocket>,
        buf: Vec<u8>,
    },
    Stream(SlipReader<BoxedReader>),
}

impl FrameReceiver {
    pub fn datagram(socket: Arc<UdpSocket>) -> Self {
        FrameReceiver::Datagram {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        FrameReceiver::Stream(SlipReader::new(Box::new(reader)))
    }

    /// Next raw OSC payload. `Ok(None)` means the peer closed the stream.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            FrameReceiver::Datagram { socket, buf } => {
                let n = socket.recv(buf).await?;
                Ok(Some(buf[..n].to_vec()))
            }
            FrameReceiver::Stream(reader) => reader.next_frame().await,
        }
    }
}

/// Resolves `host:port` and opens the chosen transport. Resolution and
/// connect share one `connect_timeout` window.
pub async fn open(
    kind: TransportKind,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(FrameSender, FrameReceiver), SessionError> {
    tokio::time::timeout(connect_timeout, resolve_and_open(kind, host, port))
        .await
        .map_err(|_| {
            SessionError::Timeout(format!(
                "opening {}:{} took longer than {:?}",
                host, port, connect_timeout
            ))
        })?
}

async fn resolve_and_open(
    kind: TransportKind,
    host: &str,
    port: u16,
) -> Result<(FrameSender, FrameReceiver), SessionError> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SessionError::Network(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| SessionError::Network(format!("no address found for {}", host)))?;

    match kind {
        TransportKind::Udp => {
            let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(addr).await?;
            let socket = Arc::new(socket);
            log::info!("UDP transport ready for {}", addr);
            Ok((
                FrameSender::datagram(socket.clone()),
                FrameReceiver::datagram(socket),
            ))
        }
        TransportKind::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            log::info!("TCP transport connected to {}", addr);
            Ok((
                FrameSender::stream(write_half),
                FrameReceiver::stream(read_half),
            ))
        }
    }
}
