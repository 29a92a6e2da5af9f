//! SPF evaluation (RFC 7208 subset): `ip4`, `ip6`, `a`, `mx`, `include`,
//! `exists` and `all` with the four qualifiers, a hard cap on DNS lookups
//! and include recursion that only propagates `pass`.

use futures::future::BoxFuture;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::auth::resolver::{DnsResolver, LookupError};
use crate::message::address_domain;

/// Mechanism-triggered DNS lookups allowed per evaluation (RFC 7208 §4.6.4).
/// The initial policy-record fetch is not charged.
const MAX_DNS_LOOKUPS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    Pass,
    Fail,
    Softfail,
    Neutral,
    None,
    Temperror,
    Permerror,
}

impl SpfResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::Softfail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::Temperror => "temperror",
            SpfResult::Permerror => "permerror",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub domain: String,
    pub ip: Option<IpAddr>,
    pub reason: String,
}

impl SpfOutcome {
    fn new(result: SpfResult, domain: &str, ip: Option<IpAddr>, reason: impl Into<String>) -> Self {
        SpfOutcome {
            result,
            domain: domain.to_string(),
            ip,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
enum SpfError {
    /// The domain publishes no SPF record. `none` at the top level,
    /// `permerror` inside an include.
    NoRecord,
    Temp(String),
    Perm(String),
}

impl From<LookupError> for SpfError {
    fn from(error: LookupError) -> Self {
        match error {
            LookupError::NotFound => SpfError::NoRecord,
            LookupError::Transient(reason) => SpfError::Temp(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Qualifier {
    Pass,
    Fail,
    Softfail,
    Neutral,
}

impl Qualifier {
    fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::Softfail => SpfResult::Softfail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

struct Verdict {
    result: SpfResult,
    reason: String,
}

pub async fn evaluate(
    resolver: &DnsResolver,
    client_ip: Option<IpAddr>,
    mail_from: &str,
) -> SpfOutcome {
    let domain = address_domain(mail_from);
    if domain.is_empty() {
        return SpfOutcome::new(SpfResult::None, "", client_ip, "null sender");
    }
    let Some(ip) = client_ip else {
        return SpfOutcome::new(
            SpfResult::Permerror,
            &domain,
            None,
            "client address unknown",
        );
    };

    let mut walker = Walker {
        resolver,
        remaining: MAX_DNS_LOOKUPS,
    };
    match walker.check_host(ip, domain.clone()).await {
        Ok(verdict) => SpfOutcome::new(verdict.result, &domain, Some(ip), verdict.reason),
        Err(SpfError::NoRecord) => {
            SpfOutcome::new(SpfResult::None, &domain, Some(ip), "no SPF record")
        }
        Err(SpfError::Temp(reason)) => {
            SpfOutcome::new(SpfResult::Temperror, &domain, Some(ip), reason)
        }
        Err(SpfError::Perm(reason)) => {
            SpfOutcome::new(SpfResult::Permerror, &domain, Some(ip), reason)
        }
    }
}

struct Walker<'a> {
    resolver: &'a DnsResolver,
    remaining: u32,
}

impl Walker<'_> {
    fn charge(&mut self) -> Result<(), SpfError> {
        if self.remaining == 0 {
            return Err(SpfError::Perm("too many DNS lookups".to_string()));
        }
        self.remaining -= 1;
        Ok(())
    }

    /// RFC 7208 check_host(). Boxed because `include` recurses.
    fn check_host(
        &mut self,
        ip: IpAddr,
        domain: String,
    ) -> BoxFuture<'_, Result<Verdict, SpfError>> {
        Box::pin(async move {
            let record = self.fetch_record(&domain).await?;

            for term in record.split_ascii_whitespace().skip(1) {
                let (qualifier, mechanism) = split_qualifier(term);

                if mechanism.eq_ignore_ascii_case("all") {
                    return Ok(Verdict {
                        result: qualifier.result(),
                        reason: format!("matched {term}"),
                    });
                }

                let matched = if let Some(spec) = strip_mechanism(mechanism, "ip4") {
                    ip4_match(ip, spec)?
                } else if let Some(spec) = strip_mechanism(mechanism, "ip6") {
                    ip6_match(ip, spec)?
                } else if let Some(rest) = strip_prefixed(mechanism, "a") {
                    self.a_match(ip, &domain, rest).await?
                } else if let Some(rest) = strip_prefixed(mechanism, "mx") {
                    self.mx_match(ip, &domain, rest).await?
                } else if let Some(target) = strip_mechanism(mechanism, "include") {
                    self.include_match(ip, target).await?
                } else if let Some(target) = strip_mechanism(mechanism, "exists") {
                    self.exists_match(target).await?
                } else if mechanism.eq_ignore_ascii_case("ptr")
                    || strip_mechanism(mechanism, "ptr").is_some()
                {
                    // ptr is discouraged by RFC 7208; treated as no-match
                    false
                } else if mechanism.contains('=') {
                    // unknown modifier, ignored
                    false
                } else {
                    return Err(SpfError::Perm(format!("unknown mechanism `{mechanism}`")));
                };

                if matched {
                    return Ok(Verdict {
                        result: qualifier.result(),
                        reason: format!("matched {term}"),
                    });
                }
            }

            Ok(Verdict {
                result: SpfResult::Neutral,
                reason: "no terminal mechanism matched".to_string(),
            })
        })
    }

    async fn fetch_record(&mut self, domain: &str) -> Result<String, SpfError> {
        let records = self.resolver.txt(domain).await?;
        let mut spf = records
            .into_iter()
            .filter(|r| r == "v=spf1" || r.starts_with("v=spf1 "));

        let Some(record) = spf.next() else {
            return Err(SpfError::NoRecord);
        };
        if spf.next().is_some() {
            return Err(SpfError::Perm(format!(
                "multiple SPF records published for {domain}"
            )));
        }
        Ok(record)
    }

    async fn a_match(&mut self, ip: IpAddr, domain: &str, rest: &str) -> Result<bool, SpfError> {
        let (target, prefix) = target_and_prefix(domain, rest)?;
        self.charge()?;
        match self.resolver.ip(&target).await {
            Ok(addrs) => Ok(addrs.iter().any(|addr| prefix_match(ip, *addr, prefix))),
            Err(LookupError::NotFound) => Ok(false),
            Err(LookupError::Transient(reason)) => Err(SpfError::Temp(reason)),
        }
    }

    async fn mx_match(&mut self, ip: IpAddr, domain: &str, rest: &str) -> Result<bool, SpfError> {
        let (target, prefix) = target_and_prefix(domain, rest)?;
        self.charge()?;
        let exchanges = match self.resolver.mx(&target).await {
            Ok(exchanges) => exchanges,
            Err(LookupError::NotFound) => return Ok(false),
            Err(LookupError::Transient(reason)) => return Err(SpfError::Temp(reason)),
        };

        for exchange in exchanges {
            self.charge()?;
            match self.resolver.ip(&exchange).await {
                Ok(addrs) => {
                    if addrs.iter().any(|addr| prefix_match(ip, *addr, prefix)) {
                        return Ok(true);
                    }
                }
                Err(LookupError::NotFound) => {}
                Err(LookupError::Transient(reason)) => return Err(SpfError::Temp(reason)),
            }
        }
        Ok(false)
    }

    /// `include` matches iff the included policy evaluates to `pass`.
    /// `fail`/`softfail`/`neutral` inside do not decide the outer record.
    async fn include_match(&mut self, ip: IpAddr, target: &str) -> Result<bool, SpfError> {
        self.charge()?;
        match self.check_host(ip, target.to_string()).await {
            Ok(verdict) => Ok(verdict.result == SpfResult::Pass),
            Err(SpfError::NoRecord) => Err(SpfError::Perm(format!(
                "included domain {target} has no SPF record"
            ))),
            Err(other) => Err(other),
        }
    }

    async fn exists_match(&mut self, target: &str) -> Result<bool, SpfError> {
        self.charge()?;
        match self.resolver.ip(target).await {
            Ok(addrs) => Ok(!addrs.is_empty()),
            Err(LookupError::NotFound) => Ok(false),
            Err(LookupError::Transient(reason)) => Err(SpfError::Temp(reason)),
        }
    }
}

fn split_qualifier(term: &str) -> (Qualifier, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (Qualifier::Pass, &term[1..]),
        Some(b'-') => (Qualifier::Fail, &term[1..]),
        Some(b'~') => (Qualifier::Softfail, &term[1..]),
        Some(b'?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    }
}

/// `name:value` mechanisms. Returns the value when `mechanism` is `name`.
fn strip_mechanism<'a>(mechanism: &'a str, name: &str) -> Option<&'a str> {
    let (head, rest) = mechanism.split_once(':')?;
    head.eq_ignore_ascii_case(name).then_some(rest)
}

/// `a` / `mx` style: bare name, `name:domain`, `name/prefix`, or both.
/// Returns everything after the name, empty string included.
fn strip_prefixed<'a>(mechanism: &'a str, name: &str) -> Option<&'a str> {
    if mechanism.eq_ignore_ascii_case(name) {
        return Some("");
    }
    let rest = mechanism.get(..name.len())?;
    if !rest.eq_ignore_ascii_case(name) {
        return None;
    }
    let tail = &mechanism[name.len()..];
    (tail.starts_with(':') || tail.starts_with('/')).then_some(tail)
}

/// Split `[:domain][/prefix]` into the lookup target and optional prefix
/// length.
fn target_and_prefix<'a>(
    current: &'a str,
    rest: &'a str,
) -> Result<(String, Option<u8>), SpfError> {
    let (domain_part, prefix_part) = match rest.split_once('/') {
        Some((domain, prefix)) => (domain, Some(prefix)),
        None => (rest, None),
    };
    let target = domain_part
        .strip_prefix(':')
        .filter(|d| !d.is_empty())
        .unwrap_or(current);

    let prefix = match prefix_part {
        Some(p) => Some(
            p.trim_start_matches('/')
                .parse::<u8>()
                .map_err(|_| SpfError::Perm(format!("malformed prefix length `{p}`")))?,
        ),
        None => None,
    };
    Ok((target.to_string(), prefix))
}

fn prefix_match(client: IpAddr, record: IpAddr, prefix: Option<u8>) -> bool {
    match prefix {
        None => client == record,
        Some(len) => match (client, record) {
            (IpAddr::V4(client), IpAddr::V4(record)) => Ipv4Net::new(record, len)
                .map(|net| net.contains(&client))
                .unwrap_or(false),
            (IpAddr::V6(client), IpAddr::V6(record)) => Ipv6Net::new(record, len)
                .map(|net| net.contains(&client))
                .unwrap_or(false),
            _ => false,
        },
    }
}

fn ip4_match(client: IpAddr, spec: &str) -> Result<bool, SpfError> {
    let IpAddr::V4(client) = client else {
        return Ok(false);
    };
    if spec.contains('/') {
        let net = spec
            .parse::<Ipv4Net>()
            .map_err(|_| SpfError::Perm(format!("malformed ip4 network `{spec}`")))?;
        Ok(net.contains(&client))
    } else {
        let addr = spec
            .parse::<Ipv4Addr>()
            .map_err(|_| SpfError::Perm(format!("malformed ip4 address `{spec}`")))?;
        Ok(addr == client)
    }
}

fn ip6_match(client: IpAddr, spec: &str) -> Result<bool, SpfError> {
    let IpAddr::V6(client) = client else {
        return Ok(false);
    };
    if spec.contains('/') {
        let net = spec
            .parse::<Ipv6Net>()
            .map_err(|_| SpfError::Perm(format!("malformed ip6 network `{spec}`")))?;
        Ok(net.contains(&client))
    } else {
        let addr = spec
            .parse::<Ipv6Addr>()
            .map_err(|_| SpfError::Perm(format!("malformed ip6 address `{spec}`")))?;
        Ok(addr == client)
    }
}
