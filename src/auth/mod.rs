//! Message authentication: SPF, DKIM and DMARC evaluation plus the policy
//! decision the ingestion pipeline acts on.

pub mod dkim;
pub mod dmarc;
#[cfg(test)]
pub(crate) mod mock;
pub mod resolver;
pub mod spf;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::{Config, DmarcEnforcement};
use crate::message::Transport;
use crate::parser::scan_headers;
use dkim::{DkimOutcome, DkimResult};
use dmarc::{DmarcOutcome, DmarcPolicy, DmarcResult};
use resolver::DnsResolver;
use spf::{SpfOutcome, SpfResult};

/// Wall-clock budget for one message's full authentication pass. DNS is
/// individually bounded as well; this is the backstop.
const ENGINE_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    Quarantine,
    Reject,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Accept => "accept",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub spf: SpfOutcome,
    pub dkim: Vec<DkimOutcome>,
    pub dmarc: DmarcOutcome,
    pub overall_pass: bool,
    pub action: PolicyAction,
}

#[derive(Clone)]
pub struct AuthEngine {
    resolver: DnsResolver,
    spf_enabled: bool,
    dkim_enabled: bool,
    dmarc_enabled: bool,
    enforcement: DmarcEnforcement,
}

impl AuthEngine {
    pub fn new(config: &Config, resolver: DnsResolver) -> Self {
        AuthEngine {
            resolver,
            spf_enabled: config.spf_enabled,
            dkim_enabled: config.dkim_enabled,
            dmarc_enabled: config.dmarc_enabled,
            enforcement: config.dmarc_enforcement,
        }
    }

    pub async fn verify(
        &self,
        transport: &Transport,
        from_domain: &str,
        raw: &[u8],
    ) -> AuthenticationResult {
        match tokio::time::timeout(ENGINE_BUDGET, self.verify_inner(transport, from_domain, raw))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(from_domain, "authentication budget exceeded");
                self.budget_exceeded(from_domain)
            }
        }
    }

    async fn verify_inner(
        &self,
        transport: &Transport,
        from_domain: &str,
        raw: &[u8],
    ) -> AuthenticationResult {
        let spf = if self.spf_enabled {
            spf::evaluate(&self.resolver, transport.client_ip, &transport.mail_from).await
        } else {
            disabled_spf(&transport.mail_from)
        };

        let dkim = if self.dkim_enabled {
            dkim::verify(&self.resolver, raw, &scan_headers(raw)).await
        } else {
            vec![DkimOutcome::none()]
        };

        let dmarc = if self.dmarc_enabled {
            dmarc::evaluate(&self.resolver, from_domain, &spf, &dkim).await
        } else {
            disabled_dmarc(from_domain)
        };

        self.conclude(spf, dkim, dmarc)
    }

    fn conclude(
        &self,
        spf: SpfOutcome,
        dkim: Vec<DkimOutcome>,
        dmarc: DmarcOutcome,
    ) -> AuthenticationResult {
        let any_dkim_pass = dkim.iter().any(|d| d.result == DkimResult::Pass);
        let overall_pass = dmarc.result == DmarcResult::Pass
            || (dmarc.result == DmarcResult::None
                && (spf.result == SpfResult::Pass || any_dkim_pass));

        let action = if self.enforcement == DmarcEnforcement::None
            || dmarc.result != DmarcResult::Fail
        {
            PolicyAction::Accept
        } else {
            match (dmarc.policy, self.enforcement) {
                (DmarcPolicy::Reject, DmarcEnforcement::Strict) => PolicyAction::Reject,
                (DmarcPolicy::Reject, _) | (DmarcPolicy::Quarantine, _) => PolicyAction::Quarantine,
                (DmarcPolicy::None, _) => PolicyAction::Accept,
            }
        };

        AuthenticationResult {
            spf,
            dkim,
            dmarc,
            overall_pass,
            action,
        }
    }

    fn budget_exceeded(&self, from_domain: &str) -> AuthenticationResult {
        let spf = SpfOutcome {
            result: SpfResult::Temperror,
            domain: String::new(),
            ip: None,
            reason: "authentication budget exceeded".to_string(),
        };
        let dkim = vec![DkimOutcome {
            result: DkimResult::Temperror,
            signing_domain: String::new(),
            selector: String::new(),
            reason: "authentication budget exceeded".to_string(),
        }];
        let dmarc = DmarcOutcome {
            result: DmarcResult::Temperror,
            from_domain: from_domain.to_string(),
            policy: DmarcPolicy::None,
            spf_aligned: false,
            dkim_aligned: false,
            reason: "authentication budget exceeded".to_string(),
        };
        self.conclude(spf, dkim, dmarc)
    }
}

fn disabled_spf(mail_from: &str) -> SpfOutcome {
    SpfOutcome {
        result: SpfResult::None,
        domain: crate::message::address_domain(mail_from),
        ip: None,
        reason: "SPF verification disabled".to_string(),
    }
}

fn disabled_dmarc(from_domain: &str) -> DmarcOutcome {
    DmarcOutcome {
        result: DmarcResult::None,
        from_domain: from_domain.to_string(),
        policy: DmarcPolicy::None,
        spf_aligned: false,
        dkim_aligned: false,
        reason: "DMARC verification disabled".to_string(),
    }
}
