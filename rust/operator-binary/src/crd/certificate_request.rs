use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::{DateTime, Utc},
    },
    kube::CustomResource,
    schemars::{self, JsonSchema},
};
use strum::Display as StrumDisplay;

/// A CertificateRequest asks for a certificate for a single DNS name, which is proven through
/// a DNS-01 challenge using the referenced DNSProvider.
///
/// The issued certificate and private key are written to a `kubernetes.io/tls` Secret.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "acme.ketches.cn",
    version = "v1alpha1",
    kind = "CertificateRequest",
    namespaced,
    status = "CertificateRequestStatus",
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.domain"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// The DNS name that the certificate should be valid for.
    ///
    /// Changing the domain of an existing request has no effect.
    #[serde(default)]
    pub domain: String,

    /// Name of the Secret (in the same namespace) that the certificate should be written to.
    #[serde(default)]
    pub secret_name: String,

    /// Name of the DNSProvider (in the same namespace) that should be used to solve the challenge.
    #[serde(rename = "dns", default)]
    pub dns_provider_ref: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub phase: Option<CertificateRequestPhase>,

    #[serde(default)]
    pub conditions: ConditionLog,
}

/// Lifecycle cursor of a [`CertificateRequest`].
///
/// `Denied` is never assigned by this operator, it is reserved for external approval gates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum CertificateRequestPhase {
    Pending,
    Approving,
    Approved,
    Denied,
    Failed,
    /// A phase that was written by someone other than this operator.
    Unrecognized(String),
}

impl CertificateRequestPhase {
    /// Position of the phase in the forward-only lifecycle.
    ///
    /// All terminal phases share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            CertificateRequestPhase::Pending => 0,
            CertificateRequestPhase::Approving => 1,
            CertificateRequestPhase::Approved
            | CertificateRequestPhase::Denied
            | CertificateRequestPhase::Failed
            | CertificateRequestPhase::Unrecognized(_) => 2,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CertificateRequestPhase::Pending => "Pending",
            CertificateRequestPhase::Approving => "Approving",
            CertificateRequestPhase::Approved => "Approved",
            CertificateRequestPhase::Denied => "Denied",
            CertificateRequestPhase::Failed => "Failed",
            CertificateRequestPhase::Unrecognized(phase) => phase,
        }
    }
}

impl From<String> for CertificateRequestPhase {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => CertificateRequestPhase::Pending,
            "Approving" => CertificateRequestPhase::Approving,
            "Approved" => CertificateRequestPhase::Approved,
            "Denied" => CertificateRequestPhase::Denied,
            "Failed" => CertificateRequestPhase::Failed,
            _ => CertificateRequestPhase::Unrecognized(value),
        }
    }
}

impl From<CertificateRequestPhase> for String {
    fn from(value: CertificateRequestPhase) -> Self {
        match value {
            CertificateRequestPhase::Unrecognized(phase) => phase,
            phase => phase.as_str().to_owned(),
        }
    }
}

impl Display for CertificateRequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, StrumDisplay)]
pub enum CertificateRequestConditionType {
    CertificateObtained,
    CertificateSecretConstructed,
    CertificateSecretSynced,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, StrumDisplay)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestCondition {
    #[serde(rename = "type")]
    pub type_: CertificateRequestConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl CertificateRequestCondition {
    pub fn succeeded(type_: CertificateRequestConditionType, reason: &str) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.to_owned(),
            message: None,
            last_transition_time: None,
        }
    }

    pub fn failed(
        type_: CertificateRequestConditionType,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status: ConditionStatus::False,
            reason: reason.to_owned(),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }
}

/// Ordered record of step outcomes.
///
/// Entries are only ever appended, repeated outcomes of the same step are kept as separate entries.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(transparent)]
pub struct ConditionLog(Vec<CertificateRequestCondition>);

impl ConditionLog {
    /// Appends `condition`, stamping it with `now` as its transition time.
    pub fn record(&mut self, mut condition: CertificateRequestCondition, now: DateTime<Utc>) {
        condition.last_transition_time = Some(Time(now));
        self.0.push(condition);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateRequestCondition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The most recent entry of the given type.
    pub fn latest(
        &self,
        type_: CertificateRequestConditionType,
    ) -> Option<&CertificateRequestCondition> {
        self.0.iter().rev().find(|cond| cond.type_ == type_)
    }
}

impl CertificateRequest {
    pub fn phase(&self) -> Option<&CertificateRequestPhase> {
        self.status.as_ref()?.phase.as_ref()
    }

    pub fn status_mut(&mut self) -> &mut CertificateRequestStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::chrono::Utc;

    use super::*;

    #[test]
    fn parse_certificate_request() {
        let cr: CertificateRequest = serde_yaml::from_str(
            r#"
apiVersion: acme.ketches.cn/v1alpha1
kind: CertificateRequest
metadata:
  name: app-tls
  namespace: default
spec:
  domain: app.example.com
  secretName: app-tls
  dns: cloudflare
status:
  phase: Pending
  conditions:
    - type: CertificateObtained
      status: "False"
      reason: ObtainCertificateFailed
      message: boom
"#,
        )
        .unwrap();
        assert_eq!(cr.spec.domain, "app.example.com");
        assert_eq!(cr.spec.secret_name, "app-tls");
        assert_eq!(cr.spec.dns_provider_ref, "cloudflare");
        assert_eq!(cr.phase(), Some(&CertificateRequestPhase::Pending));
        let status = cr.status.as_ref().unwrap();
        let cond = status
            .conditions
            .latest(CertificateRequestConditionType::CertificateObtained)
            .unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.message.as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_phase_is_preserved() {
        let status: CertificateRequestStatus =
            serde_json::from_str(r#"{"phase": "Revoked"}"#).unwrap();
        assert_eq!(
            status.phase,
            Some(CertificateRequestPhase::Unrecognized("Revoked".to_string()))
        );
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"phase": "Revoked", "conditions": []})
        );
    }

    #[test]
    fn missing_status_fields_default() {
        let status: CertificateRequestStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.phase, None);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn phase_ranks_are_forward_only() {
        use CertificateRequestPhase::*;
        assert!(Pending.rank() < Approving.rank());
        assert!(Approving.rank() < Approved.rank());
        assert_eq!(Approved.rank(), Failed.rank());
    }

    #[test]
    fn condition_log_keeps_duplicates_in_order() {
        let mut log = ConditionLog::default();
        let now = Utc::now();
        log.record(
            CertificateRequestCondition::failed(
                CertificateRequestConditionType::CertificateObtained,
                "ObtainCertificateFailed",
                "first",
            ),
            now,
        );
        log.record(
            CertificateRequestCondition::failed(
                CertificateRequestConditionType::CertificateObtained,
                "ObtainCertificateFailed",
                "second",
            ),
            now,
        );
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.latest(CertificateRequestConditionType::CertificateObtained)
                .and_then(|cond| cond.message.as_deref()),
            Some("second")
        );
        assert!(log.iter().all(|cond| cond.last_transition_time.is_some()));
    }
}
