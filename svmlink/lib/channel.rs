//! Socket channels to the service VM.
//!
//! The hypervisor exposes the service VM's transfer port on the host, usually as a Unix socket
//! bound to a guest vsock port. The protocol needs to tell the VM where the payload ends while
//! still waiting for its reply, so every [`Channel`] supports closing only its write side.

use std::{
    fmt,
    io,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::{TcpStream, UnixStream},
};

use crate::{SvmLinkError, SvmLinkResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const UNIX_SCHEME: &str = "unix:";
const TCP_SCHEME: &str = "tcp:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where the service VM's transfer port can be reached from the host.
///
/// ## Format
/// - `unix:/path/to/socket` or `unix:///path/to/socket`
/// - `tcp:host:port` or `tcp://host:port`
///
/// ## Examples
///
/// ```
/// use svmlink::Endpoint;
///
/// let endpoint = "unix:/run/svm/transfer.sock".parse::<Endpoint>().unwrap();
/// assert_eq!(endpoint, Endpoint::Unix("/run/svm/transfer.sock".into()));
///
/// let endpoint = "tcp://127.0.0.1:4500".parse::<Endpoint>().unwrap();
/// assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:4500".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A Unix domain socket on the host.
    Unix(PathBuf),

    /// A TCP address in `host:port` form.
    Tcp(String),
}

/// Dials the service VM using a fixed [`Endpoint`].
#[derive(Debug, Clone)]
pub struct SocketTransport {
    endpoint: Endpoint,
    connect_timeout: Option<Duration>,
}

/// A boxed channel returned by [`SocketTransport`], which may dial either socket family.
pub type BoxChannel = Box<dyn Channel>;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A bidirectional byte stream to the service VM whose write side can be closed on its own.
///
/// Dropping the channel closes both directions and releases the remote resource.
#[async_trait]
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {
    /// Signals end-of-payload to the peer while keeping the read side open for the reply.
    async fn close_write(&mut self) -> io::Result<()>;
}

/// Opens channels to the service VM.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// The kind of channel this provider opens.
    type Channel: Channel + 'static;

    /// Opens a fresh channel. Each transfer gets its own channel.
    async fn dial(&self) -> SvmLinkResult<Self::Channel>;

    /// Describes the remote end for logs and errors.
    fn describe(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SocketTransport {
    /// Creates a transport that dials `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: None,
        }
    }

    /// Bounds how long a dial may take before it fails with a connect error.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Returns the endpoint this transport dials.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> io::Result<BoxChannel> {
        let channel: BoxChannel = match &self.endpoint {
            Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await?),
            Endpoint::Tcp(addr) => Box::new(TcpStream::connect(addr.as_str()).await?),
        };

        Ok(channel)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Channel for UnixStream {
    async fn close_write(&mut self) -> io::Result<()> {
        // Shuts down the write half only.
        self.shutdown().await
    }
}

#[async_trait]
impl Channel for TcpStream {
    async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl Channel for DuplexStream {
    async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl Channel for BoxChannel {
    async fn close_write(&mut self) -> io::Result<()> {
        (**self).close_write().await
    }
}

#[async_trait]
impl TransportProvider for SocketTransport {
    type Channel = BoxChannel;

    async fn dial(&self) -> SvmLinkResult<BoxChannel> {
        let result = match self.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.connect()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                )),
            },
            None => self.connect().await,
        };

        result.map_err(|source| SvmLinkError::Connect {
            endpoint: self.describe(),
            source,
        })
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

impl FromStr for Endpoint {
    type Err = SvmLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(UNIX_SCHEME) {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(SvmLinkError::InvalidEndpoint(s.to_string()));
            }

            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            let addr = rest.strip_prefix("//").unwrap_or(rest);
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    return Ok(Self::Tcp(addr.to_string()));
                }
                _ => return Err(SvmLinkError::InvalidEndpoint(s.to_string())),
            }
        }

        Err(SvmLinkError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
            Self::Tcp(addr) => write!(f, "{}{}", TCP_SCHEME, addr),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
