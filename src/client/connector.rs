use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::ConnectionError;

/// A byte stream carrying one session.
pub trait Connection: Read + Write + Send {
    /// A handle that can tear the stream down from another thread, unblocking
    /// any read or write in progress.
    fn closer(&self) -> io::Result<Box<dyn Closer>>;
}

pub trait Closer: Send + Sync {
    fn close(&self);
}

/// Opens connections to one configured server.
pub trait Connector: Send {
    type Conn: Connection;

    fn connect(&mut self) -> Result<Self::Conn, ConnectionError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

impl Connection for TcpStream {
    fn closer(&self) -> io::Result<Box<dyn Closer>> {
        Ok(Box::new(TcpCloser(self.try_clone()?)))
    }
}

struct TcpCloser(TcpStream);

impl Closer for TcpCloser {
    fn close(&self) {
        if let Err(err) = self.0.shutdown(Shutdown::Both) {
            if err.kind() != io::ErrorKind::NotConnected {
                log::debug!("socket shutdown failed: {}", err);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpConnector {
    /// `addr` is `host:port`; `io_timeout` bounds every read and write, so a
    /// server that stops answering surfaces as a timeout.
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            io_timeout,
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectionError> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(|source| ConnectionError::Address {
                addr: self.addr.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::NoAddress(self.addr.clone()));
        }
        Ok(addrs)
    }
}

impl Connector for TcpConnector {
    type Conn = TcpStream;

    fn connect(&mut self) -> Result<TcpStream, ConnectionError> {
        let mut last = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    let configure = |stream: &TcpStream| -> io::Result<()> {
                        stream.set_read_timeout(Some(self.io_timeout))?;
                        stream.set_write_timeout(Some(self.io_timeout))?;
                        stream.set_nodelay(true)
                    };
                    configure(&stream).map_err(ConnectionError::Io)?;
                    return Ok(stream);
                }
                Err(source) => {
                    last = Some(ConnectionError::Connect {
                        addr: addr.to_string(),
                        source,
                    })
                }
            }
        }
        Err(last.unwrap_or_else(|| ConnectionError::NoAddress(self.addr.clone())))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}
