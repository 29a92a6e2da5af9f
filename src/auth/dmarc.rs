//! DMARC (RFC 7489) policy evaluation: record discovery with
//! organizational-domain fallback, SPF/DKIM alignment, and `p`/`sp`/`pct`
//! handling.

use serde::{Deserialize, Serialize};

use crate::auth::dkim::{DkimOutcome, DkimResult, parse_tags};
use crate::auth::resolver::{DnsResolver, LookupError};
use crate::auth::spf::{SpfOutcome, SpfResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    Temperror,
}

impl DmarcResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcResult::Pass => "pass",
            DmarcResult::Fail => "fail",
            DmarcResult::None => "none",
            DmarcResult::Temperror => "temperror",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmarcOutcome {
    pub result: DmarcResult,
    pub from_domain: String,
    /// Effective policy after `sp` selection and `pct` sampling.
    pub policy: DmarcPolicy,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub reason: String,
}

impl DmarcOutcome {
    fn none(from_domain: &str, reason: impl Into<String>) -> Self {
        DmarcOutcome {
            result: DmarcResult::None,
            from_domain: from_domain.to_string(),
            policy: DmarcPolicy::None,
            spf_aligned: false,
            dkim_aligned: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlignmentMode {
    Relaxed,
    Strict,
}

#[derive(Debug)]
struct Record {
    policy: DmarcPolicy,
    subdomain_policy: Option<DmarcPolicy>,
    pct: u8,
    aspf: AlignmentMode,
    adkim: AlignmentMode,
}

fn parse_record(record: &str) -> Option<Record> {
    let tags = parse_tags(record);
    if tags.get("v").map(String::as_str) != Some("DMARC1") {
        return None;
    }

    let parse_policy = |value: &String| match value.as_str() {
        "none" => Some(DmarcPolicy::None),
        "quarantine" => Some(DmarcPolicy::Quarantine),
        "reject" => Some(DmarcPolicy::Reject),
        _ => None,
    };
    let parse_mode = |value: Option<&String>| match value.map(String::as_str) {
        Some("s") => AlignmentMode::Strict,
        _ => AlignmentMode::Relaxed,
    };

    Some(Record {
        policy: tags.get("p").and_then(parse_policy)?,
        subdomain_policy: tags.get("sp").and_then(parse_policy),
        pct: tags
            .get("pct")
            .and_then(|p| p.parse::<u8>().ok())
            .map(|p| p.min(100))
            .unwrap_or(100),
        aspf: parse_mode(tags.get("aspf")),
        adkim: parse_mode(tags.get("adkim")),
    })
}

/// Conservative organizational-domain heuristic: a short curated list of
/// two-label public suffixes, otherwise the last two labels. Deliberately
/// weaker than the full Public Suffix List.
pub fn organizational_domain(domain: &str) -> String {
    const TWO_LABEL_SUFFIXES: &[&str] = &[
        "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.jp", "or.jp",
        "ne.jp", "co.nz", "com.br", "com.mx", "co.in", "co.za",
    ];

    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if TWO_LABEL_SUFFIXES.contains(&last_two.as_str()) {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

fn aligned(identifier: &str, from_domain: &str, mode: AlignmentMode) -> bool {
    if identifier.is_empty() || from_domain.is_empty() {
        return false;
    }
    match mode {
        AlignmentMode::Strict => identifier.eq_ignore_ascii_case(from_domain),
        AlignmentMode::Relaxed => {
            organizational_domain(identifier) == organizational_domain(from_domain)
        }
    }
}

pub async fn evaluate(
    resolver: &DnsResolver,
    from_domain: &str,
    spf: &SpfOutcome,
    dkim: &[DkimOutcome],
) -> DmarcOutcome {
    evaluate_with_roll(resolver, from_domain, spf, dkim, || {
        rand::random_range(0..100u8)
    })
    .await
}

/// `roll` decides `pct` sampling; injected so policy boundaries are
/// testable.
pub async fn evaluate_with_roll(
    resolver: &DnsResolver,
    from_domain: &str,
    spf: &SpfOutcome,
    dkim: &[DkimOutcome],
    roll: impl Fn() -> u8,
) -> DmarcOutcome {
    if from_domain.is_empty() {
        return DmarcOutcome::none("", "message has no From domain");
    }

    let (record, is_subdomain_record) = match discover_record(resolver, from_domain).await {
        Ok(Some(found)) => found,
        Ok(None) => return DmarcOutcome::none(from_domain, "no DMARC record"),
        Err(reason) => {
            return DmarcOutcome {
                result: DmarcResult::Temperror,
                from_domain: from_domain.to_string(),
                policy: DmarcPolicy::None,
                spf_aligned: false,
                dkim_aligned: false,
                reason,
            };
        }
    };

    let spf_aligned = spf.result == SpfResult::Pass && aligned(&spf.domain, from_domain, record.aspf);
    let dkim_aligned = dkim.iter().any(|outcome| {
        outcome.result == DkimResult::Pass
            && aligned(&outcome.signing_domain, from_domain, record.adkim)
    });

    if spf_aligned || dkim_aligned {
        return DmarcOutcome {
            result: DmarcResult::Pass,
            from_domain: from_domain.to_string(),
            policy: DmarcPolicy::None,
            spf_aligned,
            dkim_aligned,
            reason: if spf_aligned {
                "SPF aligned".to_string()
            } else {
                "DKIM aligned".to_string()
            },
        };
    }

    let declared = if is_subdomain_record {
        record.subdomain_policy.unwrap_or(record.policy)
    } else {
        record.policy
    };

    let (policy, reason) = if record.pct == 0 || (record.pct < 100 && roll() >= record.pct) {
        (
            DmarcPolicy::None,
            format!("not aligned; policy not applied (pct={})", record.pct),
        )
    } else {
        (declared, "neither SPF nor DKIM aligned".to_string())
    };

    DmarcOutcome {
        result: DmarcResult::Fail,
        from_domain: from_domain.to_string(),
        policy,
        spf_aligned,
        dkim_aligned,
        reason,
    }
}

/// `_dmarc.<from_domain>`, falling back to the organizational domain for
/// subdomains. The boolean marks a fallback hit (where `sp=` applies).
async fn discover_record(
    resolver: &DnsResolver,
    from_domain: &str,
) -> Result<Option<(Record, bool)>, String> {
    match lookup_record(resolver, from_domain).await? {
        Some(record) => Ok(Some((record, false))),
        None => {
            let organizational = organizational_domain(from_domain);
            if organizational == from_domain {
                return Ok(None);
            }
            Ok(lookup_record(resolver, &organizational)
                .await?
                .map(|record| (record, true)))
        }
    }
}

async fn lookup_record(
    resolver: &DnsResolver,
    domain: &str,
) -> Result<Option<Record>, String> {
    match resolver.txt(&format!("_dmarc.{domain}")).await {
        Ok(records) => Ok(records.iter().find_map(|r| parse_record(r))),
        Err(LookupError::NotFound) => Ok(None),
        Err(LookupError::Transient(reason)) => Err(reason),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::mock;

    fn spf(result: SpfResult, domain: &str) -> SpfOutcome {
        SpfOutcome {
            result,
            domain: domain.to_string(),
            ip: None,
            reason: String::new(),
        }
    }

    fn dkim(result: DkimResult, domain: &str) -> DkimOutcome {
        DkimOutcome {
            result,
            signing_domain: domain.to_string(),
            selector: "mail".to_string(),
            reason: String::new(),
        }
    }

    async fn run(
        resolver: mock::Resolver,
        from_domain: &str,
        spf: &SpfOutcome,
        dkim: &[DkimOutcome],
    ) -> DmarcOutcome {
        evaluate(&DnsResolver::mock(resolver), from_domain, spf, dkim).await
    }

    #[test]
    fn organizational_domain_heuristic() {
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("a.b.example.co.uk"), "example.co.uk");
        assert_eq!(organizational_domain("example.co.uk"), "example.co.uk");
        // the documented shortcoming of the heuristic
        assert_eq!(organizational_domain("a.b.pvt.k12.ca.us"), "ca.us");
    }

    #[tokio::test]
    async fn absent_record_is_none() {
        let outcome = run(
            mock::Resolver::default(),
            "example.com",
            &spf(SpfResult::Pass, "example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::None);
    }

    #[tokio::test]
    async fn aligned_spf_passes() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Pass, "example.com"),
            &[dkim(DkimResult::None, "")],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Pass);
        assert!(outcome.spf_aligned);
        assert!(!outcome.dkim_aligned);
    }

    #[tokio::test]
    async fn relaxed_spf_alignment_accepts_subdomain() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Pass, "bounce.example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Pass);
    }

    #[tokio::test]
    async fn strict_spf_alignment_rejects_subdomain() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject; aspf=s");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Pass, "bounce.example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Fail);
        assert_eq!(outcome.policy, DmarcPolicy::Reject);
    }

    #[tokio::test]
    async fn dkim_alignment_passes_without_spf() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=quarantine; adkim=r");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Fail, "example.com"),
            &[dkim(DkimResult::Pass, "mail.example.com")],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Pass);
        assert!(outcome.dkim_aligned);
    }

    #[tokio::test]
    async fn unaligned_fail_carries_declared_policy() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=quarantine; pct=100");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Fail, "example.com"),
            &[dkim(DkimResult::Fail, "example.com")],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Fail);
        assert_eq!(outcome.policy, DmarcPolicy::Quarantine);
    }

    #[tokio::test]
    async fn pct_zero_never_applies_policy() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject; pct=0");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Fail, "example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Fail);
        assert_eq!(outcome.policy, DmarcPolicy::None);
    }

    #[tokio::test]
    async fn pct_hundred_always_applies_policy() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject; pct=100");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Fail, "example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.policy, DmarcPolicy::Reject);
    }

    #[tokio::test]
    async fn subdomain_uses_sp_from_organizational_record() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=reject; sp=quarantine");
        let outcome = run(
            resolver,
            "news.example.com",
            &spf(SpfResult::Fail, "news.example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Fail);
        assert_eq!(outcome.policy, DmarcPolicy::Quarantine);
    }

    #[tokio::test]
    async fn transient_lookup_failure_is_temperror() {
        let resolver = mock::Resolver::default().transient_failure("_dmarc.example.com");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Pass, "example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::Temperror);
    }

    #[tokio::test]
    async fn malformed_record_is_treated_as_absent() {
        let resolver = mock::Resolver::default()
            .txt_record("_dmarc.example.com", "v=DMARC1; p=sometimes");
        let outcome = run(
            resolver,
            "example.com",
            &spf(SpfResult::Fail, "example.com"),
            &[],
        )
        .await;
        assert_eq!(outcome.result, DmarcResult::None);
    }
}
