// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS for TCP topic channels (requires the `tcp-tls` feature).
//!
//! The publisher side needs an identity (`cert_path` + `key_path`), the
//! subscriber side a CA (`ca_path`) and the server name to verify. Without
//! the feature every call fails with [`LinkError::Tls`].

use super::LinkError;
use crate::channel::SslContext;
use std::io::{Read, Write};
use std::net::TcpStream;

#[cfg(feature = "tcp-tls")]
mod imp {
    use super::*;
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};
    use std::path::Path;
    use std::sync::Arc;

    fn tls_err(what: &str, e: impl std::fmt::Display) -> LinkError {
        LinkError::Tls(format!("{}: {}", what, e))
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, LinkError> {
        let pem = std::fs::read(path)?;
        let certs = CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_err("invalid certificate PEM", e))?;
        if certs.is_empty() {
            return Err(LinkError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    /// Publisher-side TLS configuration.
    pub struct TlsAcceptor {
        config: Arc<ServerConfig>,
    }

    impl TlsAcceptor {
        pub fn new(ctx: &SslContext) -> Result<Self, LinkError> {
            let (cert, key) = match (&ctx.cert_path, &ctx.key_path) {
                (Some(c), Some(k)) => (c, k),
                _ => {
                    return Err(LinkError::Tls(
                        "publisher needs cert_path and key_path".into(),
                    ))
                }
            };
            let certs = load_certs(cert)?;
            let key_pem = std::fs::read(key)?;
            let key = PrivateKeyDer::from_pem_slice(&key_pem)
                .map_err(|e| tls_err("invalid private key PEM", e))?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| tls_err("server config", e))?;
            Ok(Self {
                config: Arc::new(config),
            })
        }

        /// Run the handshake on an accepted stream.
        pub fn accept(&self, stream: TcpStream) -> Result<Box<dyn Write + Send>, LinkError> {
            let conn = ServerConnection::new(Arc::clone(&self.config))
                .map_err(|e| tls_err("server connection", e))?;
            let mut tls = StreamOwned::new(conn, stream);
            while tls.conn.is_handshaking() {
                tls.conn
                    .complete_io(&mut tls.sock)
                    .map_err(|e| tls_err("handshake", e))?;
            }
            Ok(Box::new(tls))
        }
    }

    /// Subscriber-side TLS configuration.
    pub struct TlsConnector {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    }

    impl TlsConnector {
        pub fn new(ctx: &SslContext) -> Result<Self, LinkError> {
            let ca = ctx
                .ca_path
                .as_ref()
                .ok_or_else(|| LinkError::Tls("subscriber needs ca_path".into()))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert).map_err(|e| tls_err("root certificate", e))?;
            }
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let server_name = ServerName::try_from(ctx.server_name.clone())
                .map_err(|e| tls_err("server name", e))?;
            Ok(Self {
                config: Arc::new(config),
                server_name,
            })
        }

        pub fn connect(&self, stream: TcpStream) -> Result<Box<dyn Read + Send>, LinkError> {
            let conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
                .map_err(|e| tls_err("client connection", e))?;
            let mut tls = StreamOwned::new(conn, stream);
            while tls.conn.is_handshaking() {
                tls.conn
                    .complete_io(&mut tls.sock)
                    .map_err(|e| tls_err("handshake", e))?;
            }
            Ok(Box::new(tls))
        }
    }
}

#[cfg(not(feature = "tcp-tls"))]
mod imp {
    use super::*;

    fn disabled() -> LinkError {
        LinkError::Tls("TLS support requires the 'tcp-tls' feature".into())
    }

    pub struct TlsAcceptor;

    impl TlsAcceptor {
        pub fn new(_ctx: &SslContext) -> Result<Self, LinkError> {
            Err(disabled())
        }

        pub fn accept(&self, _stream: TcpStream) -> Result<Box<dyn Write + Send>, LinkError> {
            Err(disabled())
        }
    }

    pub struct TlsConnector;

    impl TlsConnector {
        pub fn new(_ctx: &SslContext) -> Result<Self, LinkError> {
            Err(disabled())
        }

        pub fn connect(&self, _stream: TcpStream) -> Result<Box<dyn Read + Send>, LinkError> {
            Err(disabled())
        }
    }
}

pub use imp::{TlsAcceptor, TlsConnector};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_requires_identity() {
        let ctx = SslContext::new("localhost");
        assert!(matches!(TlsAcceptor::new(&ctx), Err(LinkError::Tls(_))));
    }

    #[test]
    fn test_connector_requires_ca() {
        let ctx = SslContext::new("localhost");
        assert!(matches!(TlsConnector::new(&ctx), Err(LinkError::Tls(_))));
    }

    #[cfg(feature = "tcp-tls")]
    #[test]
    fn test_missing_files_are_io_errors() {
        let ctx = SslContext::new("localhost").with_identity("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(TlsAcceptor::new(&ctx), Err(LinkError::Io(_))));
    }
}
