use snafu::{ResultExt, Snafu};
use stackable_operator::kube::CustomResourceExt;

mod certificate_request;
mod dns_provider;

pub use certificate_request::{
    CertificateRequest, CertificateRequestCondition, CertificateRequestConditionType,
    CertificateRequestPhase, CertificateRequestSpec, CertificateRequestStatus, ConditionLog,
    ConditionStatus,
};
pub use dns_provider::{DnsProvider, DnsProviderCode, DnsProviderSpec, DnsProviderStatus};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {name} as YAML"))]
    SerializeCrd {
        source: serde_yaml::Error,
        name: &'static str,
    },
}

/// Renders all CRDs owned by this operator as a multi-document YAML stream.
pub fn crds_yaml() -> Result<String, Error> {
    let docs = [
        (
            "certificaterequests.acme.ketches.cn",
            serde_yaml::to_string(&CertificateRequest::crd()),
        ),
        (
            "dnsproviders.acme.ketches.cn",
            serde_yaml::to_string(&DnsProvider::crd()),
        ),
    ];
    let mut out = String::new();
    for (name, doc) in docs {
        out.push_str("---\n");
        out.push_str(&doc.context(SerializeCrdSnafu { name })?);
    }
    Ok(out)
}
