use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Build the TLS acceptor for pgwire from PEM files. `None` when neither path
/// is configured; plaintext connections are served then.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    // TlsAcceptor is not Debug, so `unwrap_err` is unavailable here.
    fn load_err(cert: Option<&str>, key: Option<&str>) -> std::io::Error {
        match load_tls_acceptor(cert, key) {
            Ok(_) => panic!("expected an error for cert={cert:?} key={key:?}"),
            Err(e) => e,
        }
    }

    #[test]
    fn no_paths_means_plaintext() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let err = load_err(Some("cert.pem"), None);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = load_err(None, Some("key.pem"));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_cert_file_is_io_error() {
        let dir = std::env::temp_dir().join("slotbook_test_tls");
        let err = load_err(
            Some(dir.join("absent-cert.pem").to_str().unwrap()),
            Some(dir.join("absent-key.pem").to_str().unwrap()),
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
