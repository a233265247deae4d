//! Publishes DNS-01 challenge records through the API of a DNS service
//!
//! Backends are selected by [`DnsProviderCode`] and configured from the credential map of a
//! DNSProvider. Credentials are handed to the backend explicitly, they are never exported into the
//! process environment.

pub mod alidns;
pub mod cloudflare;
pub mod tencentcloud;

use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
};

use async_trait::async_trait;
use snafu::{OptionExt, Snafu};

use crate::{crd::DnsProviderCode, utils::Unloggable};

/// Handle to a TXT record that was published by [`DnsChallengeProvider::present`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtRecord {
    /// Zone (as known to the DNS service) that the record was created in.
    pub zone: String,
    pub fqdn: String,
    /// Identifier assigned by the DNS service.
    pub id: String,
}

#[async_trait]
pub trait DnsChallengeProvider: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a TXT record named `fqdn` containing `value`.
    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, Self::Error>;

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), Self::Error>;
}

/// Credentials of a DNS service, keyed by their conventional variable names.
#[derive(Clone, Default, PartialEq)]
pub struct Credentials(Unloggable<BTreeMap<String, String>>);

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("missing credential {}", keys.join(" or ")))]
pub struct MissingCredentialError {
    keys: Vec<&'static str>,
}

impl Credentials {
    pub fn new(keys: BTreeMap<String, String>) -> Self {
        Self(Unloggable(keys))
    }

    /// Returns the first non-empty value of any of `keys`.
    pub fn get_any(&self, keys: &[&'static str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .map(String::as_str)
            .find(|value| !value.is_empty())
    }

    pub fn require_any(&self, keys: &[&'static str]) -> Result<&str, MissingCredentialError> {
        self.get_any(keys).context(MissingCredentialSnafu {
            keys: keys.to_vec(),
        })
    }
}

impl From<BTreeMap<String, String>> for Credentials {
    fn from(keys: BTreeMap<String, String>) -> Self {
        Self::new(keys)
    }
}

/// Candidate zones for `fqdn`, most specific first.
///
/// `_acme-challenge.app.example.com` yields `app.example.com` and `example.com`, the challenge label
/// itself and single-label suffixes are never zones.
pub fn zone_candidates(fqdn: &str) -> Vec<&str> {
    let fqdn = fqdn.trim_end_matches('.');
    let mut candidates = Vec::new();
    let mut rest = fqdn;
    while let Some((_, parent)) = rest.split_once('.') {
        if parent.contains('.') {
            candidates.push(parent);
        }
        rest = parent;
    }
    candidates
}

/// Picks the most specific zone among `zones` that contains `fqdn`.
pub fn find_zone<'a>(fqdn: &str, zones: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let fqdn = fqdn.trim_end_matches('.');
    zones
        .into_iter()
        .filter(|zone| {
            let zone = zone.trim_end_matches('.');
            fqdn.strip_suffix(zone)
                .is_some_and(|prefix| prefix.ends_with('.'))
        })
        .max_by_key(|zone| zone.len())
}

/// The record name of `fqdn` relative to `zone` (for example `_acme-challenge.app`).
pub fn relative_name<'a>(fqdn: &'a str, zone: &str) -> &'a str {
    let fqdn = fqdn.trim_end_matches('.');
    fqdn.strip_suffix(zone.trim_end_matches('.'))
        .and_then(|prefix| prefix.strip_suffix('.'))
        .unwrap_or(fqdn)
}

pub struct DynError(Box<dyn std::error::Error + Send + Sync>);

impl Debug for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DynError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

pub struct DynamicAdapter<P>(P);

#[async_trait]
impl<P: DnsChallengeProvider> DnsChallengeProvider for DynamicAdapter<P> {
    type Error = DynError;

    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, Self::Error> {
        self.0
            .present(fqdn, value)
            .await
            .map_err(|err| DynError(Box::new(err)))
    }

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), Self::Error> {
        self.0
            .cleanup(record)
            .await
            .map_err(|err| DynError(Box::new(err)))
    }
}

pub type Dynamic = dyn DnsChallengeProvider<Error = DynError>;

pub fn from(provider: impl DnsChallengeProvider + 'static) -> Box<Dynamic> {
    Box::new(DynamicAdapter(provider))
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum FromCodeError {
    #[snafu(display("failed to configure Cloudflare provider"), context(false))]
    Cloudflare { source: cloudflare::Error },

    #[snafu(display("failed to configure AliDNS provider"), context(false))]
    AliDns { source: alidns::Error },

    #[snafu(display("failed to configure Tencent Cloud provider"), context(false))]
    TencentCloud { source: tencentcloud::Error },
}

/// Builds the challenge backend registered for `code`.
pub fn from_code(
    code: DnsProviderCode,
    credentials: &Credentials,
    http: &reqwest::Client,
) -> Result<Box<Dynamic>, FromCodeError> {
    Ok(match code {
        DnsProviderCode::Cloudflare => {
            from(cloudflare::Cloudflare::from_credentials(credentials, http.clone())?)
        }
        DnsProviderCode::AliDns => {
            from(alidns::AliDns::from_credentials(credentials, http.clone())?)
        }
        DnsProviderCode::TencentCloud => from(tencentcloud::TencentCloud::from_credentials(
            credentials,
            http.clone(),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(pairs: &[(&str, &str)]) -> Credentials {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn zone_candidates_skip_challenge_label() {
        assert_eq!(
            zone_candidates("_acme-challenge.app.example.com"),
            vec!["app.example.com", "example.com"]
        );
        assert_eq!(
            zone_candidates("_acme-challenge.example.com."),
            vec!["example.com"]
        );
        assert!(zone_candidates("example").is_empty());
    }

    #[test]
    fn find_zone_prefers_most_specific() {
        let zones = ["example.com", "app.example.com", "ample.com"];
        assert_eq!(
            find_zone("_acme-challenge.app.example.com", zones),
            Some("app.example.com")
        );
        assert_eq!(
            find_zone("_acme-challenge.www.example.com", zones),
            Some("example.com")
        );
        assert_eq!(find_zone("_acme-challenge.example.org", zones), None);
    }

    #[test]
    fn relative_name_strips_zone() {
        assert_eq!(
            relative_name("_acme-challenge.app.example.com", "example.com"),
            "_acme-challenge.app"
        );
        assert_eq!(
            relative_name("_acme-challenge.example.com.", "example.com."),
            "_acme-challenge"
        );
    }

    #[test]
    fn credentials_lookup() {
        let creds = credentials(&[("CF_API_TOKEN", "x"), ("CF_DNS_API_TOKEN", "")]);
        assert_eq!(creds.get_any(&["CF_DNS_API_TOKEN", "CF_API_TOKEN"]), Some("x"));
        let err = creds.require_any(&["ALICLOUD_ACCESS_KEY"]).unwrap_err();
        assert_eq!(err.to_string(), "missing credential ALICLOUD_ACCESS_KEY");
        assert_eq!(format!("{creds:?}"), r#"["CF_API_TOKEN", "CF_DNS_API_TOKEN"]"#);
    }

    #[test]
    fn registry_rejects_missing_credentials() {
        let http = reqwest::Client::new();
        let empty = Credentials::default();
        assert!(matches!(
            from_code(DnsProviderCode::Cloudflare, &empty, &http),
            Err(FromCodeError::Cloudflare { .. })
        ));
        assert!(matches!(
            from_code(DnsProviderCode::AliDns, &empty, &http),
            Err(FromCodeError::AliDns { .. })
        ));
        assert!(matches!(
            from_code(DnsProviderCode::TencentCloud, &empty, &http),
            Err(FromCodeError::TencentCloud { .. })
        ));
        assert!(from_code(
            DnsProviderCode::Cloudflare,
            &credentials(&[("CF_API_TOKEN", "x")]),
            &http
        )
        .is_ok());
    }
}
