use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};
use strum::Display;

/// A DNSProvider holds the ACME account contact and the credentials of a DNS service that is
/// used to publish DNS-01 challenge records.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "acme.ketches.cn",
    version = "v1alpha1",
    kind = "DNSProvider",
    struct = "DnsProvider",
    namespaced,
    status = "DnsProviderStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct DnsProviderSpec {
    /// Which DNS service hosts the zones of the requested domains.
    pub code: DnsProviderCode,

    /// Contact address of the ACME account.
    #[serde(default)]
    pub email: String,

    /// Credentials of the DNS service, keyed by their conventional variable names
    /// (for example `CF_API_TOKEN`).
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DnsProviderStatus {}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DnsProviderCode {
    Cloudflare,
    AliDns,
    TencentCloud,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dns_provider() {
        let provider: DnsProvider = serde_yaml::from_str(
            r#"
apiVersion: acme.ketches.cn/v1alpha1
kind: DNSProvider
metadata:
  name: cloudflare
  namespace: default
spec:
  code: cloudflare
  email: admin@example.com
  keys:
    CF_API_TOKEN: x
"#,
        )
        .unwrap();
        assert_eq!(provider.spec.code, DnsProviderCode::Cloudflare);
        assert_eq!(provider.spec.email, "admin@example.com");
        assert_eq!(
            provider.spec.keys.get("CF_API_TOKEN").map(String::as_str),
            Some("x")
        );
    }

    #[test]
    fn provider_codes_are_lowercase() {
        assert_eq!(
            serde_json::from_str::<DnsProviderCode>(r#""alidns""#).unwrap(),
            DnsProviderCode::AliDns
        );
        assert_eq!(
            serde_json::from_str::<DnsProviderCode>(r#""tencentcloud""#).unwrap(),
            DnsProviderCode::TencentCloud
        );
        assert_eq!(DnsProviderCode::TencentCloud.to_string(), "tencentcloud");
        assert!(serde_json::from_str::<DnsProviderCode>(r#""route53""#).is_err());
    }
}
