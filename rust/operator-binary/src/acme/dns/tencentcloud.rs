//! Tencent Cloud DNSPod through [API 3.0](https://www.tencentcloud.com/document/product/1108/48953)

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::chrono::{DateTime, Utc};

use super::{
    find_zone, relative_name, Credentials, DnsChallengeProvider, MissingCredentialError, TxtRecord,
};
use crate::utils::Unloggable;

const HOST: &str = "dnspod.tencentcloudapi.com";
const SERVICE: &str = "dnspod";
const API_VERSION: &str = "2021-03-23";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const ALGORITHM: &str = "TC3-HMAC-SHA256";
const SIGNED_HEADERS: &str = "content-type;host";
const RECORD_TTL: u32 = 600;
const DEFAULT_RECORD_LINE: &str = "默认";

pub const KEYS_SECRET_ID: &[&str] = &["TENCENTCLOUD_SECRET_ID"];
pub const KEYS_SECRET_KEY: &[&str] = &["TENCENTCLOUD_SECRET_KEY"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Tencent Cloud credentials are incomplete"))]
    Credentials { source: MissingCredentialError },

    #[snafu(display("failed to serialize request for DNSPod action {action}"))]
    SerializeRequest {
        source: serde_json::Error,
        action: &'static str,
    },

    #[snafu(display("failed to call DNSPod action {action}"))]
    Request {
        source: reqwest::Error,
        action: &'static str,
    },

    #[snafu(display("DNSPod action {action} failed: {message} ({code})"))]
    Api {
        action: &'static str,
        code: String,
        message: String,
    },

    #[snafu(display("DNSPod action {action} returned an incomplete response"))]
    IncompleteResponse { action: &'static str },

    #[snafu(display("no DNSPod domain found for {fqdn:?}"))]
    NoZone { fqdn: String },
}

pub struct TencentCloud {
    http: reqwest::Client,
    secret_id: String,
    secret_key: Unloggable<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    response: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainListResponse {
    #[serde(default)]
    domain_list: Vec<DomainListItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainListItem {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRecordResponse {
    record_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateRecordRequest<'a> {
    domain: &'a str,
    sub_domain: &'a str,
    record_type: &'static str,
    record_line: &'static str,
    value: &'a str,
    #[serde(rename = "TTL")]
    ttl: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteRecordRequest<'a> {
    domain: &'a str,
    record_id: u64,
}

fn hmac_sha256(key: &[u8], message: &str) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Computes the `Authorization` header of a TC3-HMAC-SHA256 signed request.
fn authorization(
    secret_id: &str,
    secret_key: &str,
    payload: &str,
    timestamp: DateTime<Utc>,
) -> String {
    let date = timestamp.format("%Y-%m-%d").to_string();
    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{HOST}\n\n{SIGNED_HEADERS}\n{}",
        hex::encode(Sha256::digest(payload.as_bytes()))
    );
    let credential_scope = format!("{date}/{SERVICE}/tc3_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{credential_scope}\n{}",
        timestamp.timestamp(),
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    let secret_date = hmac_sha256(format!("TC3{secret_key}").as_bytes(), &date);
    let secret_service = hmac_sha256(&secret_date, SERVICE);
    let secret_signing = hmac_sha256(&secret_service, "tc3_request");
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign));
    format!(
        "{ALGORITHM} Credential={secret_id}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
    )
}

impl TencentCloud {
    pub fn from_credentials(
        credentials: &Credentials,
        http: reqwest::Client,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            secret_id: credentials
                .require_any(KEYS_SECRET_ID)
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

    async fn call<T: DeserializeOwned>(
        &self,
        action: &'static str,
        request: &impl Serialize,
    ) -> Result<T, Error> {
        let payload = serde_json::to_string(request).context(SerializeRequestSnafu { action })?;
        let timestamp = Utc::now();
        let envelope = self
            .http
            .post(format!("https://{HOST}/"))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("X-TC-Action", action)
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Timestamp", timestamp.timestamp().to_string())
            .header(
                reqwest::header::AUTHORIZATION,
                authorization(&self.secret_id, &self.secret_key, &payload, timestamp),
            )
            .body(payload)
            .send()
            .await
            .context(RequestSnafu { action })?
            .json::<Envelope>()
            .await
            .context(RequestSnafu { action })?;
        parse_response(action, envelope.response)
    }

    async fn find_zone(&self, fqdn: &str) -> Result<String, Error> {
        let domains = self
            .call::<DescribeDomainListResponse>("DescribeDomainList", &serde_json::json!({}))
            .await?;
        let names = domains.domain_list.iter().map(|domain| &*domain.name);
        match find_zone(fqdn, names) {
            Some(zone) => Ok(zone.to_string()),
            None => NoZoneSnafu { fqdn }.fail(),
        }
    }
}

fn parse_response<T: DeserializeOwned>(
    action: &'static str,
    mut response: serde_json::Value,
) -> Result<T, Error> {
    if let Some(error) = response.get_mut("Error").map(serde_json::Value::take) {
        let ApiError { code, message } = serde_json::from_value(error)
            .ok()
            .unwrap_or_else(|| ApiError {
                code: "Unknown".to_string(),
                message: "unreadable error response".to_string(),
            });
        return ApiSnafu {
            action,
            code,
            message,
        }
        .fail();
    }
    serde_json::from_value(response)
        .ok()
        .ok_or(Error::IncompleteResponse { action })
}

#[async_trait]
impl DnsChallengeProvider for TencentCloud {
    type Error = Error;

    async fn present(&self, fqdn: &str, value: &str) -> Result<TxtRecord, Self::Error> {
        let zone = self.find_zone(fqdn).await?;
        let record = self
            .call::<CreateRecordResponse>(
                "CreateRecord",
                &CreateRecordRequest {
                    domain: &zone,
                    sub_domain: relative_name(fqdn, &zone),
                    record_type: "TXT",
                    record_line: DEFAULT_RECORD_LINE,
                    value,
                    ttl: RECORD_TTL,
                },
            )
            .await?;
        Ok(TxtRecord {
            zone,
            fqdn: fqdn.to_string(),
            id: record.record_id.to_string(),
        })
    }

    async fn cleanup(&self, record: &TxtRecord) -> Result<(), Self::Error> {
        let record_id = record
            .id
            .parse()
            .map_err(|_| Error::IncompleteResponse {
                action: "CreateRecord",
            })?;
        self.call::<serde_json::Value>(
            "DeleteRecord",
            &DeleteRecordRequest {
                domain: &record.zone,
                record_id,
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::chrono::TimeZone;

    use super::*;

    #[test]
    fn tc3_signature() {
        let timestamp = Utc.timestamp_opt(1704164645, 0).unwrap();
        assert_eq!(
            authorization(
                "AKIDz8krbsJ5yKBZQpn74WFkmLPx3EXAMPLE",
                "Gu5t9xGARNpq86cd98joQYCN3EXAMPLE",
                r#"{"Domain":"example.com"}"#,
                timestamp,
            ),
            "TC3-HMAC-SHA256 Credential=AKIDz8krbsJ5yKBZQpn74WFkmLPx3EXAMPLE/2024-01-02/dnspod/tc3_request, \
             SignedHeaders=content-type;host, \
             Signature=a1a33688520a6642c1c7e1f0b3f18a0d2c2f9aefebadb4215b161d9048d57fe9"
        );
    }

    #[test]
    fn api_errors_are_surfaced() {
        let err = parse_response::<CreateRecordResponse>(
            "CreateRecord",
            serde_json::json!({
                "Error": {"Code": "AuthFailure.SignatureFailure", "Message": "bad signature"},
                "RequestId": "x"
            }),
        )
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "DNSPod action CreateRecord failed: bad signature (AuthFailure.SignatureFailure)"
        );
    }

    #[test]
    fn record_ids_are_parsed() {
        let response = parse_response::<CreateRecordResponse>(
            "CreateRecord",
            serde_json::json!({"RecordId": 162, "RequestId": "x"}),
        )
        .unwrap();
        assert_eq!(response.record_id, 162);
    }
}
