//! Cloudflare DNS through the [v4 API](https://developers.cloudflare.com/api/)

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use super::{zone_candidates, Credentials, DnsChallengeProvider, MissingCredentialError, TxtRecord};
use crate::utils::Unloggable;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const RECORD_TTL: u32 = 120;

pub const KEYS_API_TOKEN: &[&str] = &[
    "CF_DNS_API_TOKEN",
    "CLOUDFLARE_DNS_API_TOKEN",
    "CF_API_TOKEN",
];
pub const KEYS_API_EMAIL: &[&str] = &["CF_API_EMAIL", "CLOUDFLARE_EMAIL"];
pub const KEYS_API_KEY: &[&str] = &["CF_API_KEY", "CLOUDFLARE_API_KEY"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no Cloudflare API token or global API key configured"))]
    Credentials { source: MissingCredentialError },

    #[snafu(display("failed to call Cloudflare API {endpoint:?}"))]
    Request {
        source: reqwest::Error,
        endpoint: String,
    },

    #[snafu(display("Cloudflare API {endpoint:?} failed: {errors}"))]
    Api { endpoint: String, errors: String },

    #[snafu(display("Cloudflare API {endpoint:?} returned no result"))]
    EmptyResult { endpoint: String },

    #[snafu(display("no Cloudflare zone found for {fqdn:?}"))]
    NoZone { fqdn: String },
}

enum Auth {
    Token(Unloggable<String>),
    GlobalKey {
        email: String,
        key: Unloggable<String>,
    },
}

pub struct Cloudflare {
    http: reqwest::Client,
    auth: Auth,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct Zone {
    id: String,
}

#[derive(Deserialize)]
struct Record {
    id: String,
}

#[derive(Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

impl Cloudflare {
    pub fn from_credentials(
        credentials: &Credentials,
        http: reqwest::Client,
    ) -> Result<Self, Error> {
        let auth = match credentials.get_any(KEYS_API_TOKEN) {
            Some(token) => Auth::Token(Unloggable(token.to_string())),
            None => Auth::GlobalKey {
                email: credentials
                    .require_any(KEYS_API_EMAIL)
                    .context(CredentialsSnafu)?
                    .to_string(),
                key: Unloggable(
                    credentials
                        .require_any(KEYS_API_KEY)
                        .context(CredentialsSnafu)?
                        .to_string(),
                ),
            },
        };
        Ok(Self { http, auth })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::Token(token) => request.bearer_auth(token.as_str()),
            Auth::GlobalKey { email, key } => request
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", key.as_str()),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, Error> {
        let envelope = self
            .authorize(request)
            .send()
            .await
            .context(RequestSnafu { endpoint })?
            .json::<Envelope<T>>()
            .await
            .context(RequestSnafu { endpoint })?;
        if !envelope.success {
            return ApiSnafu {
                endpoint,
                errors: format_errors(&envelope.errors),
            }
            .fail();
        }
        Ok(envelope.result)
    }

    async fn find_zone_id(&self, fqdn: &str) -> Result<String, Error> {
        for candidate in zone_candidates(fqdn) {
            let zones = self
                .call::<Vec<Zone>>(
                    "zones",
                    self.http
                        .get(format!("{API_BASE}/zones"))
                        .query(&[("name", candidate)]),
                )
                .await?
                .unwrap_or_default();
            if let Some(zone) = zones.into_iter().next() {
                tracing::debug!(zone = candidate, fqdn, "found Cloudflare zone");
                return Ok(zone.id);
            }
        }
        NoZoneSnafu { fqdn }.fail()
    }
}

fn format_errors(errors: &[ApiMessage]) -> String {
    errors
        .iter()
        .map(|err| format!("{} ({})", err.message, err.code))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl DnsChallengeProvider for Cloudflare {
    type Error = Error;

    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, Self::Error> {
        let zone = self.find_zone_id(fqdn).await?;
        let endpoint = "dns_records";
        let record = self
            .call::<Record>(
                endpoint,
                self.http
                    .post(format!("{API_BASE}/zones/{zone}/dns_records"))
                    .json(&NewRecord {
                        type_: "TXT",
                        name: fqdn,
                        content: value,
                        ttl: RECORD_TTL,
                    }),
            )
            .await?
            .context(EmptyResultSnafu { endpoint })?;
        Ok(TxtRecord {
            zone,
            fqdn: fqdn.to_string(),
            id: record.id,
        })
    }

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), Self::Error> {
        self.call::<serde_json::Value>(
            "dns_records",
            self.http.delete(format!(
                "{API_BASE}/zones/{}/dns_records/{}",
                record.zone, record.id
            )),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn prefers_api_token() {
        let credentials = Credentials::new(BTreeMap::from([
            ("CF_API_TOKEN".to_string(), "token".to_string()),
            ("CF_API_EMAIL".to_string(), "admin@example.com".to_string()),
        ]));
        let provider = Cloudflare::from_credentials(&credentials, reqwest::Client::new()).unwrap();
        assert!(matches!(&provider.auth, Auth::Token(token) if token.as_str() == "token"));
    }

    #[test]
    fn global_key_needs_email_and_key() {
        let credentials = Credentials::new(BTreeMap::from([(
            "CF_API_KEY".to_string(),
            "key".to_string(),
        )]));
        let err = Cloudflare::from_credentials(&credentials, reqwest::Client::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Credentials { .. }));
    }

    #[test]
    fn envelope_errors_are_readable() {
        let envelope: Envelope<Record> = serde_json::from_str(
            r#"{"success": false, "errors": [{"code": 9109, "message": "Invalid access token"}], "result": null}"#,
        )
        .unwrap();
        assert!(!envelope.success);
        assert_eq!(
            format_errors(&envelope.errors),
            "Invalid access token (9109)"
        );
    }
}
