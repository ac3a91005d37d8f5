use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

pub const CERT_VAR: &str = "STOCKHOLD_TLS_CERT";
pub const KEY_VAR: &str = "STOCKHOLD_TLS_KEY";

/// PEM certificate chain and private key for the wire listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    /// Both paths or neither. Blank values count as unset.
    pub fn from_pair(cert: Option<String>, key: Option<String>) -> io::Result<Option<Self>> {
        let cert = cert.filter(|c| !c.trim().is_empty());
        let key = key.filter(|k| !k.trim().is_empty());
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: cert.into(),
                key: key.into(),
            })),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("both {CERT_VAR} and {KEY_VAR} must be set, or neither"),
            )),
        }
    }

    pub fn from_env() -> io::Result<Option<Self>> {
        Self::from_pair(std::env::var(CERT_VAR).ok(), std::env::var(KEY_VAR).ok())
    }

    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut open(&self.cert)?).collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(invalid(&self.cert, "no certificates found"));
        }
        let key = rustls_pemfile::private_key(&mut open(&self.key)?)?
            .ok_or_else(|| invalid(&self.key, "no private key found"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        tracing::info!("tls certificate loaded from {}", self.cert.display());
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn invalid(path: &Path, what: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{what} in {}", path.display()))
}
