//! Alibaba Cloud DNS through its [RPC API](https://www.alibabacloud.com/help/en/dns/api-alidns-2015-01-09-overview)

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{de::DeserializeOwned, Deserialize};
use sha1::Sha1;
use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::chrono::Utc;

use super::{
    find_zone, relative_name, Credentials, DnsChallengeProvider, MissingCredentialError, TxtRecord,
};
use crate::utils::Unloggable;

const ENDPOINT: &str = "https://alidns.aliyuncs.com";
const API_VERSION: &str = "2015-01-09";
const RECORD_TTL: &str = "600";

pub const KEYS_ACCESS_KEY: &[&str] = &["ALICLOUD_ACCESS_KEY"];
pub const KEYS_SECRET_KEY: &[&str] = &["ALICLOUD_SECRET_KEY"];

/// Characters that are left as-is by the RPC signature encoding (RFC 3986 unreserved).
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("AliDNS credentials are incomplete"))]
    Credentials { source: MissingCredentialError },

    #[snafu(display("failed to call AliDNS action {action}"))]
    Request {
        source: reqwest::Error,
        action: &'static str,
    },

    #[snafu(display("failed to parse response of AliDNS action {action}"))]
    ParseResponse {
        source: serde_json::Error,
        action: &'static str,
    },

    #[snafu(display("AliDNS action {action} failed: {message} ({code})"))]
    Api {
        action: &'static str,
        code: String,
        message: String,
    },

    #[snafu(display("no AliDNS domain found for {fqdn:?}"))]
    NoZone { fqdn: String },
}

pub struct AliDns {
    http: reqwest::Client,
    access_key: String,
    secret_key: Unloggable<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainsResponse {
    domains: DomainList,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainList {
    #[serde(default)]
    domain: Vec<Domain>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Domain {
    domain_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddDomainRecordResponse {
    record_id: String,
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

fn canonicalized_query(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Computes the `Signature` parameter for an RPC call (signature version 1.0, HMAC-SHA1).
fn sign(secret_key: &str, method: &str, params: &BTreeMap<&str, String>) -> String {
    let string_to_sign = format!(
        "{method}&{}&{}",
        percent_encode("/"),
        percent_encode(&canonicalized_query(params))
    );
    let mut mac = Hmac::<Sha1>::new_from_slice(format!("{secret_key}&").as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

impl AliDns {
    pub fn from_credentials(
        credentials: &Credentials,
        http: reqwest::Client,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            access_key: credentials
                .require_any(KEYS_ACCESS_KEY)
                .context(CredentialsSnafu)?
                .to_string(),
            secret_key: Unloggable(
                credentials
                    .require_any(KEYS_SECRET_KEY)
                    .context(CredentialsSnafu)?
                    .to_string(),
            ),
        })
    }

    fn common_params(
        &self,
        action: &'static str,
        nonce: String,
        timestamp: String,
    ) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("Action", action.to_string()),
            ("AccessKeyId", self.access_key.clone()),
            ("Format", "JSON".to_string()),
            ("SignatureMethod", "HMAC-SHA1".to_string()),
            ("SignatureNonce", nonce),
            ("SignatureVersion", "1.0".to_string()),
            ("Timestamp", timestamp),
            ("Version", API_VERSION.to_string()),
        ])
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &'static str,
        extra: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Result<T, Error> {
        let mut params = self.common_params(
            action,
            uuid::Uuid::new_v4().to_string(),
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        params.extend(extra);
        let signature = sign(&self.secret_key, "GET", &params);
        let url = format!(
            "{ENDPOINT}/?{}&Signature={}",
            canonicalized_query(&params),
            percent_encode(&signature)
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context(RequestSnafu { action })?;
        let status = response.status();
        let body = response.bytes().await.context(RequestSnafu { action })?;
        if !status.is_success() {
            let ErrorBody { code, message } =
                serde_json::from_slice(&body).context(ParseResponseSnafu { action })?;
            return ApiSnafu {
                action,
                code,
                message,
            }
            .fail();
        }
        serde_json::from_slice(&body).context(ParseResponseSnafu { action })
    }

    async fn find_zone(&self, fqdn: &str) -> Result<String, Error> {
        let domains = self
            .call::<DescribeDomainsResponse>("DescribeDomains", [("PageSize", "100".to_string())])
            .await?;
        let names = domains
            .domains
            .domain
            .iter()
            .map(|domain| domain.domain_name.as_str());
        match find_zone(fqdn, names) {
            Some(zone) => Ok(zone.to_string()),
            None => NoZoneSnafu { fqdn }.fail(),
        }
    }
}

#[async_trait]
impl DnsChallengeProvider for AliDns {
    type Error = Error;

    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, Self::Error> {
        let zone = self.find_zone(fqdn).await?;
        let record = self
            .call::<AddDomainRecordResponse>(
                "AddDomainRecord",
                [
                    ("DomainName", zone.clone()),
                    ("RR", relative_name(fqdn, &zone).to_string()),
                    ("Type", "TXT".to_string()),
                    ("Value", value.to_string()),
                    ("TTL", RECORD_TTL.to_string()),
                ],
            )
            .await?;
        Ok(TxtRecord {
            zone,
            fqdn: fqdn.to_string(),
            id: record.record_id,
        })
    }

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), Self::Error> {
        self.call::<serde_json::Value>("DeleteDomainRecord", [("RecordId", record.id.clone())])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AliDns {
        AliDns {
            http: reqwest::Client::new(),
            access_key: "testid".to_string(),
            secret_key: Unloggable("testsecret".to_string()),
        }
    }

    #[test]
    fn rpc_signature() {
        let mut params = provider().common_params(
            "DescribeDomains",
            "nonce-1".to_string(),
            "2024-01-02T03:04:05Z".to_string(),
        );
        params.insert("KeyWord", "a b*c".to_string());
        assert_eq!(
            canonicalized_query(&params),
            "AccessKeyId=testid&Action=DescribeDomains&Format=JSON&KeyWord=a%20b%2Ac\
             &SignatureMethod=HMAC-SHA1&SignatureNonce=nonce-1&SignatureVersion=1.0\
             &Timestamp=2024-01-02T03%3A04%3A05Z&Version=2015-01-09"
        );
        assert_eq!(
            sign("testsecret", "GET", &params),
            "QkcsDqOD2xQpjDGL1213UDxzlkY="
        );
    }

    #[test]
    fn parse_domain_list() {
        let response: DescribeDomainsResponse = serde_json::from_str(
            r#"{"TotalCount": 1, "Domains": {"Domain": [{"DomainName": "example.com", "DomainId": "1"}]}}"#,
        )
        .unwrap();
        assert_eq!(response.domains.domain[0].domain_name, "example.com");
    }
}
