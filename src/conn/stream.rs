//! Socket abstraction: TCP, optionally upgraded to TLS in place.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[cfg(feature = "tls")]
use crate::error::{Error, Result};

pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }

    /// Upgrade to TLS after the server accepted the SSL request.
    ///
    /// Certificates are not verified at this layer; callers needing
    /// verification restrict it in their own stack.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        match self {
            Stream::Tcp(tcp) => {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls = connector
                    .connect(host, tcp)
                    .await
                    .map_err(|e| Error::Protocol(format!("TLS handshake failed: {e}")))?;
                Ok(Stream::Tls(Box::new(tls)))
            }
            #[allow(unreachable_patterns)]
            _ => Err(Error::Protocol("stream is already TLS".into())),
        }
    }

    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        match self {
            Stream::Tcp(s) => s.read_u8().await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read_u8().await,
        }
    }

    /// Read whatever bytes are available, up to `buf.len()`.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush().await,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush().await,
        }
    }
}
