//! Waits for challenge TXT records to become visible through recursive nameservers

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use snafu::{ResultExt, Snafu};
use tokio::time::{sleep, Instant};

pub const DEFAULT_NAMESERVER: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114)), 53);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up TXT record {fqdn:?}"))]
    Lookup { source: ResolveError, fqdn: String },

    #[snafu(display("TXT record {fqdn:?} did not propagate within {timeout:?}"))]
    Timeout { fqdn: String, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationCheck {
    pub nameservers: Vec<SocketAddr>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PropagationCheck {
    fn default() -> Self {
        Self {
            nameservers: vec![DEFAULT_NAMESERVER],
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PropagationCheck {
    fn resolver(&self) -> TokioAsyncResolver {
        let mut nameservers = NameServerConfigGroup::new();
        for addr in &self.nameservers {
            nameservers.merge(NameServerConfigGroup::from_ips_clear(
                &[addr.ip()],
                addr.port(),
                true,
            ));
        }
        let mut opts = ResolverOpts::default();
        // Negative answers must not be cached between polls
        opts.cache_size = 0;
        TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], nameservers), opts)
    }

    /// Polls until one of the TXT records at `fqdn` contains `value`.
    #[tracing::instrument(skip(self, value))]
    pub async fn wait_for_txt(&self, fqdn: &str, value: &str) -> Result<(), Error> {
        let resolver = self.resolver();
        let deadline = Instant::now() + self.timeout;
        loop {
            match resolver.txt_lookup(fqdn).await {
                Ok(records) => {
                    let mut texts = records.iter().map(|txt| txt.to_string());
                    if texts.any(|text| txt_matches(&text, value)) {
                        tracing::debug!("challenge record has propagated");
                        return Ok(());
                    }
                }
                Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {}
                Err(err) => return Err::<(), _>(err).context(LookupSnafu { fqdn }),
            }
            if Instant::now() + self.poll_interval > deadline {
                return TimeoutSnafu {
                    fqdn,
                    timeout: self.timeout,
                }
                .fail();
            }
            tracing::debug!(retry_in = ?self.poll_interval, "challenge record not visible yet");
            sleep(self.poll_interval).await;
        }
    }
}

fn txt_matches(record: &str, value: &str) -> bool {
    record.trim_matches('"') == value
}

/// Parses a nameserver address, defaulting to port 53 when none is given.
pub fn parse_nameserver(addr: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    addr.parse::<SocketAddr>()
        .or_else(|_| addr.parse().map(|ip| SocketAddr::new(ip, 53)))
}
