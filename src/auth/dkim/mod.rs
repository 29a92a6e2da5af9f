//! DKIM verification (RFC 6376) and signing for the outbound path.

pub mod canonicalization;
mod sign;

pub use sign::{DEFAULT_SIGNED_HEADERS, SignError, SigningKey, sign_message};

use base64ct::{Base64, Encoding};
use rsa::{Pkcs1v15Sign, RsaPublicKey, pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;

use crate::auth::resolver::{DnsResolver, LookupError};
use crate::parser::{HeaderScan, RawHeader};
use canonicalization::Canonicalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimResult {
    Pass,
    Fail,
    Permerror,
    Temperror,
    None,
}

impl DkimResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::Permerror => "permerror",
            DkimResult::Temperror => "temperror",
            DkimResult::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimOutcome {
    pub result: DkimResult,
    pub signing_domain: String,
    pub selector: String,
    pub reason: String,
}

impl DkimOutcome {
    fn new(result: DkimResult, domain: &str, selector: &str, reason: impl Into<String>) -> Self {
        DkimOutcome {
            result,
            signing_domain: domain.to_string(),
            selector: selector.to_string(),
            reason: reason.into(),
        }
    }

    pub fn none() -> Self {
        DkimOutcome::new(DkimResult::None, "", "", "no DKIM signatures present")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    RsaSha256,
    Ed25519Sha256,
}

impl FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsa-sha256" => Ok(SigningAlgorithm::RsaSha256),
            "ed25519-sha256" => Ok(SigningAlgorithm::Ed25519Sha256),
            // RFC 8301 forbids verifying sha-1 signatures
            other => Err(format!("unsupported signing algorithm `{other}`")),
        }
    }
}

impl std::fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SigningAlgorithm::RsaSha256 => "rsa-sha256",
            SigningAlgorithm::Ed25519Sha256 => "ed25519-sha256",
        })
    }
}

/// A parsed `DKIM-Signature` header.
#[derive(Debug, Clone)]
pub struct Signature {
    pub algorithm: SigningAlgorithm,
    pub domain: String,
    pub selector: String,
    pub canonicalization: Canonicalization,
    pub signed_headers: Vec<String>,
    pub body_hash: String,
    pub signature: Vec<u8>,
    pub body_length: Option<usize>,
    /// Original folded header text, needed to include the signature header
    /// itself (with `b=` emptied) in the header hash.
    raw: String,
}

pub fn parse_tags(value: &str) -> HashMap<String, String> {
    value
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl Signature {
    pub fn parse(header: &RawHeader) -> Result<Signature, String> {
        let tags = parse_tags(&header.value);

        for required in ["v", "a", "d", "s", "b", "bh", "h"] {
            if !tags.contains_key(required) {
                return Err(format!("missing required tag `{required}=`"));
            }
        }
        if tags["v"] != "1" {
            return Err(format!("unsupported version `{}`", tags["v"]));
        }

        let algorithm = tags["a"].parse::<SigningAlgorithm>()?;
        let canonicalization = match tags.get("c") {
            Some(c) => c.parse::<Canonicalization>()?,
            None => Canonicalization::default(),
        };
        let signed_headers: Vec<String> = tags["h"]
            .split(':')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if signed_headers.is_empty() {
            return Err("empty h= tag".to_string());
        }

        let signature = Base64::decode_vec(&strip_wsp(&tags["b"]))
            .map_err(|_| "b= tag is not valid base64".to_string())?;
        let body_length = match tags.get("l") {
            Some(l) => Some(l.parse::<usize>().map_err(|_| "malformed l= tag")?),
            None => None,
        };

        Ok(Signature {
            algorithm,
            domain: tags["d"].to_ascii_lowercase(),
            selector: tags["s"].to_string(),
            canonicalization,
            signed_headers,
            body_hash: strip_wsp(&tags["bh"]),
            signature,
            body_length,
            raw: header.raw.clone(),
        })
    }

    pub fn dns_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }

    /// True when the canonicalized (and possibly `l=`-truncated) body hashes
    /// to `bh=`.
    pub fn body_hash_matches(&self, body: &str) -> bool {
        let canonical = self.canonicalization.body.canonicalize_body(body);
        let bytes = canonical.as_bytes();
        let truncated = match self.body_length {
            Some(len) => &bytes[..bytes.len().min(len)],
            None => bytes,
        };
        let digest = Sha256::digest(truncated);
        Base64::encode_string(digest.as_slice()) == self.body_hash
    }

    /// The exact octets whose SHA-256 digest is signed: the named message
    /// headers (repeated names consumed bottom-up), then this signature
    /// header with an empty `b=` value and no trailing CRLF.
    pub fn header_hash_input(&self, scan: &HeaderScan) -> String {
        let algorithm = self.canonicalization.header;
        let selected = select_signed_headers(scan, &self.signed_headers);
        let mut out = algorithm.canonicalize_headers(&selected);

        let own = algorithm.canonicalize_header(&strip_b_value(&self.raw));
        out.push_str(own.strip_suffix("\r\n").unwrap_or(&own));
        out
    }
}

/// Headers named in `h=`, in order; repeated names are consumed bottom-up
/// per RFC 6376 §5.4.2. Returns the raw folded texts, ready for header
/// canonicalization. Shared between the verifier and the signer.
pub(crate) fn select_signed_headers<N: AsRef<str>>(
    scan: &HeaderScan,
    names: &[N],
) -> Vec<String> {
    let mut used = vec![false; scan.headers.len()];
    let mut selected = Vec::new();

    for name in names {
        let found = scan
            .headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, h)| !used[*i] && h.name.eq_ignore_ascii_case(name.as_ref()));
        if let Some((i, header)) = found {
            used[i] = true;
            selected.push(header.raw.clone());
        }
    }
    selected
}

fn strip_wsp(text: &str) -> String {
    text.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

/// Remove the value of the `b=` tag while leaving every other byte of the
/// header untouched (simple canonicalization depends on that).
fn strip_b_value(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut from = 0;
    while let Some(pos) = raw[from..].find("b=") {
        let at = from + pos;
        let boundary =
            at == 0 || matches!(bytes[at - 1], b';' | b' ' | b'\t' | b'\r' | b'\n');
        if boundary {
            let value_start = at + 2;
            let value_end = raw[value_start..]
                .find(';')
                .map(|j| value_start + j)
                .unwrap_or(raw.len());
            return format!("{}{}", &raw[..value_start], &raw[value_end..]);
        }
        from = at + 2;
    }
    raw.to_string()
}

/// Public key record published at `<selector>._domainkey.<domain>`.
struct KeyRecord {
    key_type: String,
    public_key: Vec<u8>,
}

fn parse_key_record(record: &str) -> Result<KeyRecord, String> {
    let tags = parse_tags(record);
    if let Some(version) = tags.get("v")
        && version != "DKIM1"
    {
        return Err(format!("unsupported key record version `{version}`"));
    }
    let Some(p) = tags.get("p") else {
        return Err("key record has no p= tag".to_string());
    };
    let p = strip_wsp(p);
    if p.is_empty() {
        return Err("key has been revoked (empty p= tag)".to_string());
    }
    let public_key =
        Base64::decode_vec(&p).map_err(|_| "p= tag is not valid base64".to_string())?;

    Ok(KeyRecord {
        key_type: tags.get("k").cloned().unwrap_or_else(|| "rsa".to_string()),
        public_key,
    })
}

/// The first record that parses wins; otherwise the first parse error is
/// reported.
fn first_parseable_key(records: &[String]) -> Result<KeyRecord, String> {
    let mut first_error = None;
    for record in records {
        match parse_key_record(record) {
            Ok(key) => return Ok(key),
            Err(reason) => first_error.get_or_insert(reason),
        };
    }
    Err(first_error.unwrap_or_else(|| "empty key record set".to_string()))
}

fn verify_signature(
    signature: &Signature,
    key: &KeyRecord,
    header_hash_input: &str,
) -> Result<(), String> {
    let digest = Sha256::digest(header_hash_input.as_bytes());

    match signature.algorithm {
        SigningAlgorithm::RsaSha256 => {
            if key.key_type != "rsa" {
                return Err(format!(
                    "algorithm rsa-sha256 does not match key type `{}`",
                    key.key_type
                ));
            }
            let public_key = RsaPublicKey::from_public_key_der(&key.public_key)
                .or_else(|_| RsaPublicKey::from_pkcs1_der(&key.public_key))
                .map_err(|e| format!("unparseable RSA public key: {e}"))?;
            public_key
                .verify(
                    Pkcs1v15Sign::new::<Sha256>(),
                    digest.as_slice(),
                    &signature.signature,
                )
                .map_err(|_| "signature does not verify".to_string())
        }
        SigningAlgorithm::Ed25519Sha256 => {
            if key.key_type != "ed25519" {
                return Err(format!(
                    "algorithm ed25519-sha256 does not match key type `{}`",
                    key.key_type
                ));
            }
            let public_key = ring_compat::ring::signature::UnparsedPublicKey::new(
                &ring_compat::ring::signature::ED25519,
                &key.public_key,
            );
            public_key
                .verify(digest.as_slice(), &signature.signature)
                .map_err(|_| "signature does not verify".to_string())
        }
    }
}

/// Verify every `DKIM-Signature` header of the message. An empty result
/// never occurs: a message without signatures yields one synthetic `none`.
pub async fn verify(resolver: &DnsResolver, raw: &[u8], scan: &HeaderScan) -> Vec<DkimOutcome> {
    let signatures: Vec<&RawHeader> = scan.all("DKIM-Signature").collect();
    if signatures.is_empty() {
        return vec![DkimOutcome::none()];
    }

    let body = String::from_utf8_lossy(&raw[scan.body_offset..]);
    let mut outcomes = Vec::with_capacity(signatures.len());

    for header in signatures {
        let tags = parse_tags(&header.value);
        let domain = tags.get("d").cloned().unwrap_or_default().to_ascii_lowercase();
        let selector = tags.get("s").cloned().unwrap_or_default();

        let signature = match Signature::parse(header) {
            Ok(signature) => signature,
            Err(reason) => {
                outcomes.push(DkimOutcome::new(
                    DkimResult::Permerror,
                    &domain,
                    &selector,
                    reason,
                ));
                continue;
            }
        };

        if !signature.body_hash_matches(&body) {
            outcomes.push(DkimOutcome::new(
                DkimResult::Fail,
                &domain,
                &selector,
                "body hash mismatch",
            ));
            continue;
        }

        let key = match resolver.txt(&signature.dns_name()).await {
            Ok(records) => match first_parseable_key(&records) {
                Ok(key) => key,
                Err(reason) => {
                    outcomes.push(DkimOutcome::new(
                        DkimResult::Permerror,
                        &domain,
                        &selector,
                        reason,
                    ));
                    continue;
                }
            },
            Err(LookupError::NotFound) => {
                outcomes.push(DkimOutcome::new(
                    DkimResult::Permerror,
                    &domain,
                    &selector,
                    format!("no key record at {}", signature.dns_name()),
                ));
                continue;
            }
            Err(LookupError::Transient(reason)) => {
                outcomes.push(DkimOutcome::new(
                    DkimResult::Temperror,
                    &domain,
                    &selector,
                    reason,
                ));
                continue;
            }
        };

        let outcome = match verify_signature(&signature, &key, &signature.header_hash_input(scan))
        {
            Ok(()) => DkimOutcome::new(DkimResult::Pass, &domain, &selector, "signature verified"),
            Err(reason) if reason == "signature does not verify" => {
                DkimOutcome::new(DkimResult::Fail, &domain, &selector, reason)
            }
            Err(reason) => DkimOutcome::new(DkimResult::Permerror, &domain, &selector, reason),
        };
        outcomes.push(outcome);
    }

    outcomes
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::mock;
    use crate::parser::scan_headers;
    use ring_compat::ring::rand::SystemRandom;
    use ring_compat::ring::signature::{Ed25519KeyPair, KeyPair};

    const MESSAGE: &[u8] = b"From: alice@example.com\r\nTo: bob@example.org\r\nSubject: greetings\r\nDate: Mon, 2 Feb 2026 10:00:00 +0000\r\n\r\nHello Bob,\r\nregards.\r\n";

    fn ed25519_setup() -> (SigningKey, String) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate key");
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("parse generated key");
        let public_b64 = Base64::encode_string(key_pair.public_key().as_ref());
        let record = format!("v=DKIM1; k=ed25519; p={public_b64}");
        (SigningKey::Ed25519(Box::new(key_pair)), record)
    }

    fn signed_message(key: &SigningKey) -> Vec<u8> {
        let header = sign_message(MESSAGE, key, "example.com", "mail", &DEFAULT_SIGNED_HEADERS)
            .expect("signing succeeds");
        let mut signed = header.into_bytes();
        signed.extend_from_slice(MESSAGE);
        signed
    }

    #[tokio::test]
    async fn sign_then_verify_round_trip() {
        let (key, record) = ed25519_setup();
        let signed = signed_message(&key);
        let resolver = DnsResolver::mock(
            mock::Resolver::default().txt_record("mail._domainkey.example.com", &record),
        );

        let outcomes = verify(&resolver, &signed, &scan_headers(&signed)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, DkimResult::Pass, "{}", outcomes[0].reason);
        assert_eq!(outcomes[0].signing_domain, "example.com");
        assert_eq!(outcomes[0].selector, "mail");
    }

    #[tokio::test]
    async fn altered_body_fails_the_body_hash() {
        let (key, record) = ed25519_setup();
        let mut signed = signed_message(&key);
        let at = signed.len() - 4;
        signed[at] = b'!';
        let resolver = DnsResolver::mock(
            mock::Resolver::default().txt_record("mail._domainkey.example.com", &record),
        );

        let outcomes = verify(&resolver, &signed, &scan_headers(&signed)).await;
        assert_eq!(outcomes[0].result, DkimResult::Fail);
        assert_eq!(outcomes[0].reason, "body hash mismatch");
    }

    #[tokio::test]
    async fn altered_signed_header_fails_verification() {
        let (key, record) = ed25519_setup();
        let signed = signed_message(&key);
        let text = String::from_utf8(signed).unwrap();
        let tampered = text.replace("Subject: greetings", "Subject: tampered!");
        let resolver = DnsResolver::mock(
            mock::Resolver::default().txt_record("mail._domainkey.example.com", &record),
        );

        let outcomes =
            verify(&resolver, tampered.as_bytes(), &scan_headers(tampered.as_bytes())).await;
        assert_eq!(outcomes[0].result, DkimResult::Fail);
        assert_eq!(outcomes[0].reason, "signature does not verify");
    }

    #[tokio::test]
    async fn missing_key_is_permerror() {
        let (key, _record) = ed25519_setup();
        let signed = signed_message(&key);
        let resolver = DnsResolver::mock(mock::Resolver::default());

        let outcomes = verify(&resolver, &signed, &scan_headers(&signed)).await;
        assert_eq!(outcomes[0].result, DkimResult::Permerror);
    }

    #[tokio::test]
    async fn transient_dns_failure_is_temperror() {
        let (key, _record) = ed25519_setup();
        let signed = signed_message(&key);
        let resolver = DnsResolver::mock(
            mock::Resolver::default().transient_failure("mail._domainkey.example.com"),
        );

        let outcomes = verify(&resolver, &signed, &scan_headers(&signed)).await;
        assert_eq!(outcomes[0].result, DkimResult::Temperror);
    }

    #[tokio::test]
    async fn unsigned_message_yields_synthetic_none() {
        let resolver = DnsResolver::mock(mock::Resolver::default());
        let outcomes = verify(&resolver, MESSAGE, &scan_headers(MESSAGE)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, DkimResult::None);
    }

    #[tokio::test]
    async fn missing_required_tag_is_permerror() {
        let raw = b"DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=mail; h=from; b=AAAA\r\nFrom: a@example.com\r\n\r\nbody\r\n";
        let resolver = DnsResolver::mock(mock::Resolver::default());
        let outcomes = verify(&resolver, raw, &scan_headers(raw)).await;
        assert_eq!(outcomes[0].result, DkimResult::Permerror);
        assert!(outcomes[0].reason.contains("bh="));
    }

    #[tokio::test]
    async fn sha1_signatures_are_permerror() {
        let raw = b"DKIM-Signature: v=1; a=rsa-sha1; d=example.com; s=mail; h=from; bh=AAAA; b=AAAA\r\nFrom: a@example.com\r\n\r\nbody\r\n";
        let resolver = DnsResolver::mock(mock::Resolver::default());
        let outcomes = verify(&resolver, raw, &scan_headers(raw)).await;
        assert_eq!(outcomes[0].result, DkimResult::Permerror);
        assert!(outcomes[0].reason.contains("rsa-sha1"));
    }

    #[test]
    fn b_value_is_stripped_at_tag_boundary_only() {
        let raw = "DKIM-Signature: v=1; bh=Qb=; b=SGVsbG8=\r\n";
        assert_eq!(strip_b_value(raw), "DKIM-Signature: v=1; bh=Qb=; b=");
    }

    #[test]
    fn key_record_parsing() {
        let record = parse_key_record("v=DKIM1; k=ed25519; p=AAAA").unwrap();
        assert_eq!(record.key_type, "ed25519");
        assert_eq!(record.public_key.len(), 3);

        assert!(parse_key_record("v=DKIM1; p=").is_err());
        assert!(parse_key_record("k=rsa").is_err());

        let default_type = parse_key_record("p=AAAA").unwrap();
        assert_eq!(default_type.key_type, "rsa");
    }
}
