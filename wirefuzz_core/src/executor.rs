use crate::config::{Protocol, TargetConfig};
use crate::input::{Input, Testcase};
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest payload that fits in a single UDP datagram over IPv4.
pub const MAX_DATAGRAM: usize = 65507;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Could not resolve target {target}: {source}")]
    Resolve { target: String, source: io::Error },
    #[error("Target {0} resolved to no addresses")]
    NoAddress(String),
    #[error("Could not create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("Could not connect to {target}: {source}")]
    Connect { target: String, source: io::Error },
    #[error("Sending to {target} failed: {source}")]
    Send { target: String, source: io::Error },
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("Invalid ALPN protocol list: {0}")]
    Alpn(String),
}

/// What happened to a single delivery attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The target reset the connection before the testcase could be written.
    /// The testcase is skipped.
    Reset,
}

/// Delivers testcases to the target.
///
/// An `Err` means the target could not be reached at all, which the
/// orchestrator treats as a crash signal.
pub trait Transport: Send + Sync {
    fn deliver(&self, testcase: &Testcase) -> Result<Delivery, TransportError>;
}

/// The open connection handed to a [`SendHook`].
pub enum Connection<'a> {
    Tcp(&'a TcpStream),
    Udp(&'a UdpSocket, SocketAddr),
    Unix(&'a UnixStream),
    /// The TLS or DTLS session, already past its handshake.
    Secure(&'a mut dyn Write),
}

/// Protocol-specific setup around each delivery.
///
/// `pre_send` runs after the connection is established and before the testcase
/// is written, `post_send` after the write and before the connection is closed.
/// Both default to doing nothing.
pub trait SendHook: Send + Sync {
    fn pre_send(&self, _conn: Connection<'_>, _testcase: &Testcase) {}
    fn post_send(&self, _conn: Connection<'_>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl SendHook for NoopHook {}

/// Encodes a comma separated ALPN list (`"h2,http/1.1"`) into the
/// length-prefixed wire format expected by TLS libraries.
///
/// Rejects lists of 65535 bytes or more, entries longer than 255 bytes and
/// empty entries.
pub fn encode_alpn(list: &str) -> Result<Vec<u8>, TransportError> {
    if list.len() >= 65535 {
        return Err(TransportError::Alpn(format!(
            "list is {} bytes, must be shorter than 65535",
            list.len()
        )));
    }
    let mut out = Vec::with_capacity(list.len() + 1);
    for proto in list.split(',') {
        if proto.is_empty() {
            return Err(TransportError::Alpn("empty protocol entry".to_string()));
        }
        if proto.len() > 255 {
            return Err(TransportError::Alpn(format!(
                "protocol entry of {} bytes exceeds 255",
                proto.len()
            )));
        }
        out.push(proto.len() as u8);
        out.extend_from_slice(proto.as_bytes());
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub destroy: bool,
}

impl From<&TargetConfig> for TransportOptions {
    fn from(target: &TargetConfig) -> Self {
        Self {
            connect_timeout: target.connect_timeout(),
            send_timeout: target.send_timeout(),
            destroy: target.destroy,
        }
    }
}

/// The closed set of delivery channels, chosen once from configuration.
pub enum Channel {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Unix(PathBuf),
    #[cfg(feature = "tls")]
    Tls {
        addr: SocketAddr,
        server_name: String,
        connector: openssl::ssl::SslConnector,
    },
    #[cfg(feature = "tls")]
    Dtls {
        addr: SocketAddr,
        server_name: String,
        connector: openssl::ssl::SslConnector,
    },
}

/// Socket-based [`Transport`] opening a fresh connection per testcase.
pub struct SocketTransport {
    channel: Channel,
    options: TransportOptions,
    hook: Arc<dyn SendHook>,
}

impl SocketTransport {
    pub fn new(channel: Channel, options: TransportOptions) -> Self {
        Self {
            channel,
            options,
            hook: Arc::new(NoopHook),
        }
    }

    /// Resolves the target and prepares the channel for its protocol.
    pub fn from_config(target: &TargetConfig) -> Result<Self, TransportError> {
        let options = TransportOptions::from(target);
        let channel = match target.protocol {
            Protocol::Unix => Channel::Unix(PathBuf::from(&target.host)),
            Protocol::Tcp | Protocol::Udp => {
                let addr = resolve(&target.host, target.port.unwrap_or_default())?;
                secure_or_plain(target, addr)?
            }
        };
        Ok(Self::new(channel, options))
    }

    pub fn with_hook(mut self, hook: Arc<dyn SendHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn deliver_tcp(&self, addr: &SocketAddr, testcase: &Testcase) -> Result<Delivery, TransportError> {
        let stream = match TcpStream::connect_timeout(addr, self.options.connect_timeout) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(%addr, "connection reset while connecting, skipping testcase");
                return Ok(Delivery::Reset);
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    target: addr.to_string(),
                    source,
                });
            }
        };
        if let Err(e) = stream.set_write_timeout(Some(self.options.send_timeout)) {
            debug!(error = %e, "could not set write timeout");
        }

        self.hook.pre_send(Connection::Tcp(&stream), testcase);
        if let Err(e) = (&stream).write_all(testcase.as_bytes()) {
            warn!(%addr, error = %e, "write failed");
        }
        self.hook.post_send(Connection::Tcp(&stream));

        if self.options.destroy {
            if let Err(e) = abort_on_close(&stream) {
                debug!(error = %e, "could not enable abortive close");
            }
        }
        Ok(Delivery::Sent)
    }

    fn deliver_udp(&self, addr: &SocketAddr, testcase: &Testcase) -> Result<Delivery, TransportError> {
        let socket = UdpSocket::bind(unspecified_for(addr)).map_err(TransportError::Socket)?;

        self.hook.pre_send(Connection::Udp(&socket, *addr), testcase);
        // Oversized payloads go out as consecutive maximum-size datagrams.
        for chunk in testcase.as_bytes().chunks(MAX_DATAGRAM) {
            socket
                .send_to(chunk, addr)
                .map_err(|source| TransportError::Send {
                    target: addr.to_string(),
                    source,
                })?;
        }
        self.hook.post_send(Connection::Udp(&socket, *addr));
        Ok(Delivery::Sent)
    }

    fn deliver_unix(&self, path: &Path, testcase: &Testcase) -> Result<Delivery, TransportError> {
        let stream = match UnixStream::connect(path) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(?path, "connection reset while connecting, skipping testcase");
                return Ok(Delivery::Reset);
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    target: path.display().to_string(),
                    source,
                });
            }
        };
        if let Err(e) = stream.set_write_timeout(Some(self.options.send_timeout)) {
            debug!(error = %e, "could not set write timeout");
        }

        self.hook.pre_send(Connection::Unix(&stream), testcase);
        if let Err(e) = (&stream).write_all(testcase.as_bytes()) {
            warn!(?path, error = %e, "write failed");
        }
        self.hook.post_send(Connection::Unix(&stream));
        Ok(Delivery::Sent)
    }
}

impl Transport for SocketTransport {
    fn deliver(&self, testcase: &Testcase) -> Result<Delivery, TransportError> {
        match &self.channel {
            Channel::Tcp(addr) => self.deliver_tcp(addr, testcase),
            Channel::Udp(addr) => self.deliver_udp(addr, testcase),
            Channel::Unix(path) => self.deliver_unix(path, testcase),
            #[cfg(feature = "tls")]
            Channel::Tls {
                addr,
                server_name,
                connector,
            } => secure::deliver_tls(self, addr, server_name, connector, testcase),
            #[cfg(feature = "tls")]
            Channel::Dtls {
                addr,
                server_name,
                connector,
            } => secure::deliver_dtls(self, addr, server_name, connector, testcase),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let target = format!("{host}:{port}");
    (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            target: target.clone(),
            source,
        })?
        .next()
        .ok_or(TransportError::NoAddress(target))
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

#[cfg(not(feature = "tls"))]
fn secure_or_plain(target: &TargetConfig, addr: SocketAddr) -> Result<Channel, TransportError> {
    if target.tls {
        return Err(TransportError::Tls(
            "TLS support was not compiled in".to_string(),
        ));
    }
    Ok(match target.protocol {
        Protocol::Udp => Channel::Udp(addr),
        _ => Channel::Tcp(addr),
    })
}

#[cfg(feature = "tls")]
fn secure_or_plain(target: &TargetConfig, addr: SocketAddr) -> Result<Channel, TransportError> {
    use openssl::ssl::SslMethod;

    if !target.tls {
        return Ok(match target.protocol {
            Protocol::Udp => Channel::Udp(addr),
            _ => Channel::Tcp(addr),
        });
    }
    let alpn = target.alpn.as_deref().map(encode_alpn).transpose()?;
    let server_name = target.host.clone();
    Ok(match target.protocol {
        Protocol::Udp => Channel::Dtls {
            addr,
            server_name,
            connector: secure::connector(SslMethod::dtls(), alpn.as_deref())?,
        },
        _ => Channel::Tls {
            addr,
            server_name,
            connector: secure::connector(SslMethod::tls(), alpn.as_deref())?,
        },
    })
}

/// Sets `SO_LINGER` to zero so that closing the socket sends a RST.
fn abort_on_close(stream: &TcpStream) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: the fd is owned by `stream` and `linger` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&linger as *const libc::linger).cast::<libc::c_void>(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(feature = "tls")]
mod secure {
    use super::*;
    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
    use std::io::Read;

    pub(super) fn connector(
        method: SslMethod,
        alpn: Option<&[u8]>,
    ) -> Result<SslConnector, TransportError> {
        let mut builder =
            SslConnector::builder(method).map_err(|e| TransportError::Tls(e.to_string()))?;
        builder.set_verify(SslVerifyMode::NONE);
        if let Some(protos) = alpn {
            builder
                .set_alpn_protos(protos)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
        Ok(builder.build())
    }

    /// A connected UDP socket presented as a byte stream for the DTLS session.
    #[derive(Debug)]
    pub(super) struct DatagramStream(UdpSocket);

    impl Read for DatagramStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.recv(buf)
        }
    }

    impl Write for DatagramStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.send(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn handshake<S>(
        connector: &SslConnector,
        server_name: &str,
        stream: S,
    ) -> Result<openssl::ssl::SslStream<S>, TransportError>
    where
        S: Read + Write + std::fmt::Debug,
    {
        let config = connector
            .configure()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .verify_hostname(false);
        config
            .connect(server_name, stream)
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))
    }

    pub(super) fn deliver_tls(
        transport: &SocketTransport,
        addr: &SocketAddr,
        server_name: &str,
        connector: &SslConnector,
        testcase: &Testcase,
    ) -> Result<Delivery, TransportError> {
        let stream = match TcpStream::connect_timeout(addr, transport.options.connect_timeout) {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(Delivery::Reset),
            Err(source) => {
                return Err(TransportError::Connect {
                    target: addr.to_string(),
                    source,
                });
            }
        };
        let timeout = Some(transport.options.send_timeout);
        if let Err(e) = stream
            .set_write_timeout(timeout)
            .and_then(|()| stream.set_read_timeout(timeout))
        {
            debug!(error = %e, "could not set socket timeouts");
        }

        let mut session = handshake(connector, server_name, stream)?;
        transport
            .hook
            .pre_send(Connection::Secure(&mut session), testcase);
        if let Err(e) = session.write_all(testcase.as_bytes()) {
            warn!(%addr, error = %e, "TLS write failed");
        }
        transport.hook.post_send(Connection::Secure(&mut session));

        if transport.options.destroy {
            if let Err(e) = abort_on_close(session.get_ref()) {
                debug!(error = %e, "could not enable abortive close");
            }
        } else if let Err(e) = session.shutdown() {
            debug!(error = %e, "TLS shutdown failed");
        }
        Ok(Delivery::Sent)
    }

    pub(super) fn deliver_dtls(
        transport: &SocketTransport,
        addr: &SocketAddr,
        server_name: &str,
        connector: &SslConnector,
        testcase: &Testcase,
    ) -> Result<Delivery, TransportError> {
        let socket = UdpSocket::bind(unspecified_for(addr)).map_err(TransportError::Socket)?;
        socket.connect(addr).map_err(|source| TransportError::Connect {
            target: addr.to_string(),
            source,
        })?;
        socket
            .set_read_timeout(Some(transport.options.connect_timeout))
            .map_err(TransportError::Socket)?;

        let mut session = handshake(connector, server_name, DatagramStream(socket))?;
        transport
            .hook
            .pre_send(Connection::Secure(&mut session), testcase);
        if let Err(e) = session.write_all(testcase.as_bytes()) {
            warn!(%addr, error = %e, "DTLS write failed");
        }
        transport.hook.post_send(Connection::Secure(&mut session));
        if let Err(e) = session.shutdown() {
            debug!(error = %e, "DTLS shutdown failed");
        }
        Ok(Delivery::Sent)
    }
}
