// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream sockets shared by topic links and RPC links.
//!
//! [`StreamListener`] and [`Connection`] hide the difference between TCP
//! and Unix domain sockets. Listeners are non-blocking so acceptor threads
//! can poll a stop flag.

use super::LinkError;
use crate::channel::{ChannelEndpoint, ChannelKind, PeerCredentials};
use crate::config::NodeConfig;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique socket path inside the configured UDS directory.
#[cfg(unix)]
pub(crate) fn uds_path(config: &NodeConfig, hint: &str) -> PathBuf {
    let hint: String = hint
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(32)
        .collect();
    config.uds_dir.join(format!(
        "rendez-{}-{}-{}.sock",
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::Relaxed),
        hint
    ))
}

/// Listening stream socket.
pub enum StreamListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Uds { listener: UnixListener, path: PathBuf },
}

impl StreamListener {
    /// Bind a listener for `kind` (TCP or UDS). `hint` is folded into the
    /// UDS socket file name.
    pub fn bind(kind: ChannelKind, config: &NodeConfig, hint: &str) -> Result<Self, LinkError> {
        let listener = match kind {
            ChannelKind::Tcp | ChannelKind::Ws => {
                StreamListener::Tcp(TcpListener::bind(SocketAddr::new(config.bind_address, 0))?)
            }
            #[cfg(unix)]
            ChannelKind::Uds => {
                let path = uds_path(config, hint);
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                StreamListener::Uds { listener, path }
            }
            other => return Err(LinkError::Unsupported(other)),
        };
        match &listener {
            StreamListener::Tcp(l) => l.set_nonblocking(true)?,
            #[cfg(unix)]
            StreamListener::Uds { listener, .. } => listener.set_nonblocking(true)?,
        }
        Ok(listener)
    }

    /// Endpoint advertised to the Master. `kind` picks between `tcp` and `ws`.
    pub fn endpoint(&self, kind: ChannelKind) -> Result<ChannelEndpoint, LinkError> {
        match self {
            StreamListener::Tcp(l) => {
                let addr = l.local_addr()?;
                Ok(match kind {
                    ChannelKind::Ws => ChannelEndpoint::Ws { addr },
                    _ => ChannelEndpoint::Tcp { addr },
                })
            }
            #[cfg(unix)]
            StreamListener::Uds { path, .. } => Ok(ChannelEndpoint::Uds { path: path.clone() }),
        }
    }

    /// Accept one pending connection, if any. The returned connection is
    /// in blocking mode.
    pub fn accept(&self) -> io::Result<Option<Connection>> {
        let conn = match self {
            StreamListener::Tcp(l) => match l.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true).ok();
                    Connection::Tcp(stream)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            },
            #[cfg(unix)]
            StreamListener::Uds { listener, .. } => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Connection::Uds(stream)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            },
        };
        Ok(Some(conn))
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let StreamListener::Uds { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connected stream socket.
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Uds(UnixStream),
}

impl Connection {
    /// Connect to a TCP or UDS endpoint.
    pub fn connect(endpoint: &ChannelEndpoint, timeout: Duration) -> Result<Self, LinkError> {
        match endpoint {
            ChannelEndpoint::Tcp { addr } | ChannelEndpoint::Ws { addr } => {
                let stream = TcpStream::connect_timeout(addr, timeout)?;
                stream.set_nodelay(true).ok();
                Ok(Connection::Tcp(stream))
            }
            #[cfg(unix)]
            ChannelEndpoint::Uds { path } => Ok(Connection::Uds(UnixStream::connect(path)?)),
            other => Err(LinkError::Unsupported(other.kind())),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Connection::Tcp(s) => s.try_clone().map(Connection::Tcp),
            #[cfg(unix)]
            Connection::Uds(s) => s.try_clone().map(Connection::Uds),
        }
    }

    /// Shut both directions down; unblocks any thread reading a clone.
    pub fn shutdown(&self) {
        let _ = match self {
            Connection::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Connection::Uds(s) => s.shutdown(Shutdown::Both),
        };
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(unix)]
            Connection::Uds(s) => s.set_write_timeout(timeout),
        }
    }

    /// Credentials of the process on the other end of a UDS connection.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        match self {
            Connection::Tcp(_) => None,
            #[cfg(unix)]
            Connection::Uds(s) => peer_credentials(s).ok(),
        }
    }

    /// Take the TCP stream out, for TLS and WebSocket wrapping.
    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            Connection::Tcp(s) => Some(s),
            #[cfg(unix)]
            Connection::Uds(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Connection::Tcp(s) => s
                .peer_addr()
                .map(|a| format!("tcp://{}", a))
                .unwrap_or_else(|_| "tcp://?".into()),
            #[cfg(unix)]
            Connection::Uds(_) => "uds peer".into(),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Connection::Uds(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Connection::Uds(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Connection::Uds(s) => s.flush(),
        }
    }
}

#[cfg(target_os = "linux")]
fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY:
    // - the fd is owned by `stream` and open for the duration of the call
    // - `cred` is a valid, writable ucred and `len` holds its exact size
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn peer_credentials(stream: &UnixStream) -> io::Result<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY:
    // - the fd is owned by `stream` and open for the duration of the call
    // - uid and gid are valid out-pointers
    let ret = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCredentials { pid: -1, uid, gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{read_frame, write_frame};
    use std::thread;

    fn accept_blocking(listener: &StreamListener) -> Connection {
        loop {
            if let Some(conn) = listener.accept().unwrap() {
                return conn;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_tcp_listener_round_trip() {
        let config = NodeConfig::default();
        let listener = StreamListener::bind(ChannelKind::Tcp, &config, "t").unwrap();
        let endpoint = listener.endpoint(ChannelKind::Tcp).unwrap();
        assert_eq!(endpoint.kind(), ChannelKind::Tcp);
        assert!(listener.accept().unwrap().is_none());

        let mut client = Connection::connect(&endpoint, Duration::from_secs(1)).unwrap();
        let mut server = accept_blocking(&listener);
        assert!(server.peer_credentials().is_none());

        write_frame(&mut client, b"hello", 1024).unwrap();
        assert_eq!(read_frame(&mut server, 1024).unwrap().unwrap(), b"hello");

        client.shutdown();
        assert!(read_frame(&mut server, 1024).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_uds_listener_reports_credentials_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::default().with_uds_dir(dir.path());
        let listener = StreamListener::bind(ChannelKind::Uds, &config, "chatter/topic").unwrap();
        let endpoint = listener.endpoint(ChannelKind::Uds).unwrap();
        let path = match &endpoint {
            ChannelEndpoint::Uds { path } => path.clone(),
            other => panic!("unexpected endpoint {other}"),
        };
        assert!(path.exists());

        let _client = Connection::connect(&endpoint, Duration::from_secs(1)).unwrap();
        let server = accept_blocking(&listener);
        let creds = server.peer_credentials().unwrap();
        assert_eq!(creds.uid, unsafe { libc::getuid() });

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_unsupported_kinds() {
        let config = NodeConfig::default();
        assert!(matches!(
            StreamListener::bind(ChannelKind::Udp, &config, "x"),
            Err(LinkError::Unsupported(ChannelKind::Udp))
        ));
    }
}
