//! TLS material and policy: PEM loading, TLS 1.2+ with a restricted cipher
//! and curve set, certificate expiry tracking, and SIGHUP-driven reload.

use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs::File, io};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self, CipherSuite, NamedGroup, ProtocolVersion,
        crypto::{CryptoProvider, aws_lc_rs},
        pki_types::{CertificateDer, PrivateKeyDer},
        version,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("no certificate found in the certificate file")]
    CertificateNotFound,
    #[error("failed to configure TLS: {0}")]
    Config(#[from] rustls::Error),
}

const ALLOWED_CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

const ALLOWED_KX_GROUPS: &[NamedGroup] = &[
    NamedGroup::X25519,
    NamedGroup::secp256r1,
    NamedGroup::secp384r1,
];

pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub not_after: Option<DateTime<Utc>>,
}

/// Certificate material that can be swapped at runtime. SIGHUP triggers a
/// reload from the same paths; readers hold the acceptor briefly.
pub struct ReloadableTls {
    cert_path: PathBuf,
    key_path: PathBuf,
    material: RwLock<Arc<TlsMaterial>>,
}

impl ReloadableTls {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<ReloadableTls, TlsError> {
        let material = build_material(cert_path, key_path)?;
        Ok(ReloadableTls {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            material: RwLock::new(Arc::new(material)),
        })
    }

    pub async fn reload(&self) -> Result<(), TlsError> {
        let material = build_material(&self.cert_path, &self.key_path)?;
        *self.material.write().await = Arc::new(material);
        info!("reloaded TLS certificate material");
        Ok(())
    }

    pub async fn acceptor(&self) -> TlsAcceptor {
        self.material.read().await.acceptor.clone()
    }

    /// Material is considered valid when its parsed expiry lies in the
    /// future; an unparseable expiry was already logged at load time.
    pub async fn valid(&self) -> bool {
        match self.material.read().await.not_after {
            Some(not_after) => not_after > Utc::now(),
            None => true,
        }
    }

    pub fn spawn_sighup_reload(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("failed to install SIGHUP handler: {e}");
                        return;
                    }
                };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = hangup.recv() => {
                        if let Err(e) = self.reload().await {
                            error!("certificate reload failed: {e}");
                        }
                    }
                }
            }
        });
    }
}

fn load_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let mut cert_reader =
        io::BufReader::new(File::open(cert_path).map_err(TlsError::Certificate)?);
    let mut key_reader = io::BufReader::new(File::open(key_path).map_err(TlsError::PrivateKey)?);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(TlsError::Certificate)?;
    if certs.is_empty() {
        return Err(TlsError::CertificateNotFound);
    }
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(TlsError::PrivateKey)?
        .ok_or(TlsError::PrivateKeyNotFound)?;

    Ok((certs, key))
}

fn build_material(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial, TlsError> {
    let (certs, key) = load_pem(cert_path, key_path)?;

    let not_after = cert_not_after(certs[0].as_ref());
    match not_after {
        Some(not_after) if not_after <= Utc::now() => {
            warn!("certificate expired at {not_after}; TLS will be reported unavailable");
        }
        Some(not_after) => info!("certificate valid until {not_after}"),
        None => warn!("could not parse certificate expiry"),
    }

    let config = server_config(certs, key)?;
    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        not_after,
    })
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, TlsError> {
    let base = aws_lc_rs::default_provider();

    let cipher_suites: Vec<_> = ALLOWED_CIPHER_SUITES
        .iter()
        .filter_map(|allowed| {
            base.cipher_suites
                .iter()
                .find(|suite| suite.suite() == *allowed)
                .copied()
        })
        .collect();
    let kx_groups: Vec<_> = ALLOWED_KX_GROUPS
        .iter()
        .filter_map(|allowed| {
            base.kx_groups
                .iter()
                .find(|group| group.name() == *allowed)
                .copied()
        })
        .collect();

    let provider = CryptoProvider {
        cipher_suites,
        kx_groups,
        ..base
    };

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&version::TLS12, &version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}

/// Protocol version label for metrics.
pub fn version_label(version: Option<ProtocolVersion>) -> &'static str {
    match version {
        Some(ProtocolVersion::TLSv1_2) => "TLSv1.2",
        Some(ProtocolVersion::TLSv1_3) => "TLSv1.3",
        _ => "unknown",
    }
}

/// Cipher-suite label for metrics, OpenSSL-style naming.
pub fn cipher_label(suite: Option<CipherSuite>) -> &'static str {
    match suite {
        Some(CipherSuite::TLS13_AES_128_GCM_SHA256) => "TLS_AES_128_GCM_SHA256",
        Some(CipherSuite::TLS13_AES_256_GCM_SHA384) => "TLS_AES_256_GCM_SHA384",
        Some(CipherSuite::TLS13_CHACHA20_POLY1305_SHA256) => "TLS_CHACHA20_POLY1305_SHA256",
        Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256) => {
            "ECDHE-ECDSA-AES128-GCM-SHA256"
        }
        Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384) => {
            "ECDHE-ECDSA-AES256-GCM-SHA384"
        }
        Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256) => {
            "ECDHE-ECDSA-CHACHA20-POLY1305"
        }
        Some(CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256) => "ECDHE-RSA-AES128-GCM-SHA256",
        Some(CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384) => "ECDHE-RSA-AES256-GCM-SHA384",
        Some(CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256) => {
            "ECDHE-RSA-CHACHA20-POLY1305"
        }
        _ => "unknown",
    }
}

/// notAfter of an X.509 certificate via a minimal DER walk; enough
/// structure awareness to find the validity sequence without a full
/// parser.
pub fn cert_not_after(der: &[u8]) -> Option<DateTime<Utc>> {
    let (tag, certificate, _) = read_tlv(der)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, tbs, _) = read_tlv(certificate)?;
    if tag != 0x30 {
        return None;
    }

    let mut cursor = tbs;
    // optional [0] version
    if let Some((0xA0, _, rest)) = read_tlv(cursor) {
        cursor = rest;
    }
    // serialNumber, signature algorithm, issuer
    for _ in 0..3 {
        let (_, _, rest) = read_tlv(cursor)?;
        cursor = rest;
    }
    let (tag, validity, _) = read_tlv(cursor)?;
    if tag != 0x30 {
        return None;
    }

    let (_, _, rest) = read_tlv(validity)?;
    let (tag, not_after, _) = read_tlv(rest)?;
    parse_der_time(tag, not_after)
}

/// One TLV: (tag, value, remainder). Handles short and long length forms.
fn read_tlv(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *data.first()?;
    let first_len = *data.get(1)?;

    let (length, header_len) = if first_len & 0x80 == 0 {
        (first_len as usize, 2)
    } else {
        let len_bytes = (first_len & 0x7F) as usize;
        if len_bytes == 0 || len_bytes > 4 {
            return None;
        }
        let mut length = 0usize;
        for i in 0..len_bytes {
            length = (length << 8) | *data.get(2 + i)? as usize;
        }
        (length, 2 + len_bytes)
    };

    let value = data.get(header_len..header_len + length)?;
    Some((tag, value, &data[header_len + length..]))
}

fn parse_der_time(tag: u8, bytes: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (year, rest) = match tag {
        // UTCTime: YYMMDDHHMMSSZ, sliding window per X.509
        0x17 => {
            let yy: i32 = text.get(..2)?.parse().ok()?;
            let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
            (year, text.get(2..)?)
        }
        // GeneralizedTime: YYYYMMDDHHMMSSZ
        0x18 => (text.get(..4)?.parse().ok()?, text.get(4..)?),
        _ => return None,
    };

    let field = |range: std::ops::Range<usize>| -> Option<u32> { rest.get(range)?.parse().ok() };
    Utc.with_ymd_and_hms(
        year,
        field(0..2)?,
        field(2..4)?,
        field(4..6)?,
        field(6..8)?,
        field(8..10)?,
    )
    .single()
}

#[cfg(test)]
mod test {
    use super::*;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if content.len() < 128 {
            out.push(content.len() as u8);
        } else {
            let len = content.len();
            out.push(0x82);
            out.push((len >> 8) as u8);
            out.push((len & 0xFF) as u8);
        }
        out.extend_from_slice(content);
        out
    }

    /// Just enough TBS structure for the walker: serial, sig alg, issuer,
    /// then validity with two UTCTime values.
    fn fake_certificate(not_after: &str) -> Vec<u8> {
        let validity = tlv(
            0x30,
            &[
                tlv(0x17, b"250101000000Z"),
                tlv(0x17, not_after.as_bytes()),
            ]
            .concat(),
        );
        let tbs = tlv(
            0x30,
            &[
                tlv(0x02, &[0x01]),
                tlv(0x30, &[]),
                tlv(0x30, &[]),
                validity,
            ]
            .concat(),
        );
        tlv(0x30, &tbs)
    }

    #[test]
    fn not_after_is_extracted_from_utctime() {
        let der = fake_certificate("261231235959Z");
        let not_after = cert_not_after(&der).unwrap();
        assert_eq!(
            not_after,
            Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn generalized_time_is_supported() {
        let validity = tlv(
            0x30,
            &[
                tlv(0x18, b"20250101000000Z"),
                tlv(0x18, b"20581231235959Z"),
            ]
            .concat(),
        );
        let tbs = tlv(
            0x30,
            &[
                tlv(0x02, &[0x01]),
                tlv(0x30, &[]),
                tlv(0x30, &[]),
                validity,
            ]
            .concat(),
        );
        let der = tlv(0x30, &tbs);
        let not_after = cert_not_after(&der).unwrap();
        assert_eq!(not_after.format("%Y").to_string(), "2058");
    }

    #[test]
    fn optional_version_field_is_skipped() {
        let validity = tlv(
            0x30,
            &[
                tlv(0x17, b"250101000000Z"),
                tlv(0x17, b"270601120000Z"),
            ]
            .concat(),
        );
        let tbs = tlv(
            0x30,
            &[
                tlv(0xA0, &tlv(0x02, &[0x02])),
                tlv(0x02, &[0x01]),
                tlv(0x30, &[]),
                tlv(0x30, &[]),
                validity,
            ]
            .concat(),
        );
        let der = tlv(0x30, &tbs);
        let not_after = cert_not_after(&der).unwrap();
        assert_eq!(
            not_after,
            Utc.with_ymd_and_hms(2027, 6, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn garbage_yields_no_expiry() {
        assert!(cert_not_after(b"not a certificate").is_none());
        assert!(cert_not_after(&[]).is_none());
    }

    #[test]
    fn labels_for_negotiated_parameters() {
        assert_eq!(version_label(Some(ProtocolVersion::TLSv1_3)), "TLSv1.3");
        assert_eq!(version_label(None), "unknown");
        assert_eq!(
            cipher_label(Some(CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384)),
            "ECDHE-RSA-AES256-GCM-SHA384"
        );
    }
}
