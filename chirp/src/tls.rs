//! Loading of the PEM credentials named in the configuration.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use rustls::{Certificate, PrivateKey};

use chirp_proto::{Config, TlsContext};

use crate::node::InitError;

/// Build the node's TLS context from the configured PEM files
pub(crate) fn load_context(config: &Config) -> Result<TlsContext, InitError> {
    let cert_path = config
        .cert_chain_pem
        .as_deref()
        .expect("validated configuration has a certificate chain");
    let key_path = config
        .private_key_pem
        .as_deref()
        .expect("validated configuration has a private key");
    let certs = load_certs(cert_path).map_err(InitError::Credentials)?;
    let key = load_key(key_path).map_err(InitError::Credentials)?;
    Ok(TlsContext::new(certs, key)?)
}

fn load_certs(path: &Path) -> io::Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates in PEM file",
        ));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> io::Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    for item in rustls_pemfile::read_all(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no private key in PEM file",
    ))
}
