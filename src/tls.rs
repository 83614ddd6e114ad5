//! TLS certificate discovery.
//!
//! Looks for an existing certificate/key pair for a hostname in the usual
//! certificate directories. The daemon serves plaintext when none is found;
//! the discovery result only informs which URL scheme we advertise.

use std::path::PathBuf;

use log::{debug, info};

/// A discovered certificate/key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Candidate directories, checked in order. `{host}` is substituted.
const CERT_DIRS: &[&str] = &[
    "/etc/letsencrypt/live/{host}",
    "/etc/ssl/{host}",
    "/usr/local/etc/certs/{host}",
];

/// Search the fixed directory list for a usable pair.
pub fn find_certificate(hostname: &str) -> Option<CertPair> {
    for pattern in CERT_DIRS {
        let dir = PathBuf::from(pattern.replace("{host}", hostname));
        for (cert_name, key_name) in [
            ("fullchain.pem", "privkey.pem"),
            ("cert.pem", "key.pem"),
        ] {
            let pair = CertPair {
                cert: dir.join(cert_name),
                key: dir.join(key_name),
            };
            if pair.cert.is_file() && pair.key.is_file() {
                info!("found certificate for {hostname} in {}", dir.display());
                return Some(pair);
            }
        }
        debug!("no certificate for {hostname} in {}", dir.display());
    }
    None
}

/// Scheme to advertise in connection URLs.
pub fn url_scheme(hostname: &str) -> &'static str {
    if find_certificate(hostname).is_some() {
        "wss"
    } else {
        "ws"
    }
}
