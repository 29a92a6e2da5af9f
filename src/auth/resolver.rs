use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
};

#[cfg(test)]
use crate::auth::mock;

/// A failed lookup either means the name has no such records (a definitive
/// answer) or the resolution itself failed. SPF/DKIM/DMARC map the two to
/// very different results, so the distinction is preserved here.
#[derive(Debug)]
pub enum LookupError {
    NotFound,
    Transient(String),
}

pub type LookupResult<T> = Result<T, LookupError>;

/// DNS facade for the auth engine. Real resolution goes through hickory
/// with a bounded per-call deadline; under `cfg(test)` the whole resolver
/// is swapped for an in-memory mock.
#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
}

/// Per-call resolution deadline. A slow authoritative server must not be
/// able to pin request tasks.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new(servers: &[SocketAddr]) -> Self {
        let mut options = ResolverOpts::default();
        options.timeout = LOOKUP_TIMEOUT;
        options.attempts = 2;

        let mut config = ResolverConfig::new();
        let default_servers: &[SocketAddr] = &[
            "1.1.1.1:53".parse().expect("valid resolver address"),
            "8.8.8.8:53".parse().expect("valid resolver address"),
        ];
        for addr in if servers.is_empty() {
            default_servers
        } else {
            servers
        } {
            config.add_name_server(NameServerConfig {
                socket_addr: *addr,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                http_endpoint: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }

        Self {
            resolver: Resolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(options)
                .build(),
        }
    }

    #[cfg(test)]
    pub fn new(_servers: &[SocketAddr]) -> Self {
        Self {
            resolver: mock::Resolver::default(),
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver) -> Self {
        Self { resolver }
    }

    /// All TXT strings published at `name`, chunks joined per record.
    #[cfg(not(test))]
    pub async fn txt(&self, name: &str) -> LookupResult<Vec<String>> {
        let name = fqdn(name);
        let lookup = self
            .resolver
            .txt_lookup(name.as_str())
            .await
            .map_err(classify)?;

        let records = lookup
            .into_iter()
            .map(|record| {
                let data = record
                    .txt_data()
                    .iter()
                    .flat_map(|chunk| chunk.iter())
                    .copied()
                    .collect::<Vec<_>>();
                String::from_utf8_lossy(&data).into_owned()
            })
            .collect::<Vec<_>>();

        if records.is_empty() {
            return Err(LookupError::NotFound);
        }
        Ok(records)
    }

    /// A/AAAA addresses for `name`.
    #[cfg(not(test))]
    pub async fn ip(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        let name = fqdn(name);
        let lookup = self
            .resolver
            .lookup_ip(name.as_str())
            .await
            .map_err(classify)?;
        let addrs = lookup.into_iter().collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(LookupError::NotFound);
        }
        Ok(addrs)
    }

    /// MX exchange names for `name`, ordered by preference.
    #[cfg(not(test))]
    pub async fn mx(&self, name: &str) -> LookupResult<Vec<String>> {
        let name = fqdn(name);
        let lookup = self
            .resolver
            .mx_lookup(name.as_str())
            .await
            .map_err(classify)?;
        let mut records = lookup
            .into_iter()
            .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
            .collect::<Vec<_>>();
        if records.is_empty() {
            return Err(LookupError::NotFound);
        }
        records.sort_by_key(|(preference, _)| *preference);
        Ok(records.into_iter().map(|(_, exchange)| exchange).collect())
    }

    #[cfg(test)]
    pub async fn txt(&self, name: &str) -> LookupResult<Vec<String>> {
        self.resolver.txt(name)
    }

    #[cfg(test)]
    pub async fn ip(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        self.resolver.ip(name)
    }

    #[cfg(test)]
    pub async fn mx(&self, name: &str) -> LookupResult<Vec<String>> {
        self.resolver.mx(name)
    }
}

/// Fully-qualified lookups skip the search-path dance.
#[cfg(not(test))]
fn fqdn(name: &str) -> String {
    let name = name.trim_end_matches('.');
    format!("{name}.")
}

#[cfg(not(test))]
fn classify(error: hickory_resolver::ResolveError) -> LookupError {
    if error.is_no_records_found() {
        LookupError::NotFound
    } else {
        LookupError::Transient(error.to_string())
    }
}
