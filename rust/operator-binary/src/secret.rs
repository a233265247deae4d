//! Turns an issued certificate into the `kubernetes.io/tls` [`Secret`] requested by a [`CertificateRequest`]

use kube_acme_crd_utils::SecretReference;
use snafu::{ensure, OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{api::ObjectMeta, Resource},
};

use crate::{crd::CertificateRequest, OPERATOR_NAME};

pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const FILE_PEM_CERT_CERT: &str = "tls.crt";
pub const FILE_PEM_CERT_KEY: &str = "tls.key";

const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("CertificateRequest has no namespace"))]
    NoNamespace,

    #[snafu(display("CertificateRequest does not specify a secretName"))]
    NoSecretName,

    #[snafu(display("failed to build owner reference to the CertificateRequest"))]
    BuildOwnerReference,

    #[snafu(display("issued certificate for {secret} is empty"))]
    EmptyCertificate { secret: SecretReference },

    #[snafu(display("issued private key for {secret} is empty"))]
    EmptyPrivateKey { secret: SecretReference },
}

/// The target address of the Secret requested by `cr`.
pub fn secret_reference(cr: &CertificateRequest) -> Result<SecretReference, Error> {
    let namespace = cr.metadata.namespace.clone().context(NoNamespaceSnafu)?;
    ensure!(!cr.spec.secret_name.is_empty(), NoSecretNameSnafu);
    Ok(SecretReference {
        namespace,
        name: cr.spec.secret_name.clone(),
    })
}

/// Builds the Secret holding `certificate` and `private_key`.
///
/// Both payload entries are always present in the returned Secret. The Secret is owned by `cr`,
/// so it is garbage collected together with the request.
pub fn build_tls_secret(
    cr: &CertificateRequest,
    certificate: &[u8],
    private_key: &[u8],
) -> Result<Secret, Error> {
    let secret_ref = secret_reference(cr)?;
    ensure!(
        !certificate.is_empty(),
        EmptyCertificateSnafu {
            secret: secret_ref.clone()
        }
    );
    ensure!(
        !private_key.is_empty(),
        EmptyPrivateKeySnafu {
            secret: secret_ref.clone()
        }
    );
    let owner = cr
        .controller_owner_ref(&())
        .context(BuildOwnerReferenceSnafu)?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_ref.name),
            namespace: Some(secret_ref.namespace),
            labels: Some([(LABEL_MANAGED_BY.to_string(), OPERATOR_NAME.to_string())].into()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        type_: Some(SECRET_TYPE_TLS.to_string()),
        data: Some(
            [
                (
                    FILE_PEM_CERT_CERT.to_string(),
                    ByteString(certificate.to_vec()),
                ),
                (
                    FILE_PEM_CERT_KEY.to_string(),
                    ByteString(private_key.to_vec()),
                ),
            ]
            .into(),
        ),
        ..Secret::default()
    })
}

#[cfg(test)]
mod tests {
    use stackable_operator::{k8s_openapi::ByteString, kube::api::ObjectMeta};

    use super::*;
    use crate::crd::CertificateRequestSpec;

    fn request(namespace: Option<&str>, secret_name: &str) -> CertificateRequest {
        CertificateRequest {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: namespace.map(str::to_string),
                uid: Some("1234".to_string()),
                ..ObjectMeta::default()
            },
            spec: CertificateRequestSpec {
                domain: "app.example.com".to_string(),
                secret_name: secret_name.to_string(),
                dns_provider_ref: "cloudflare".to_string(),
            },
            status: None,
        }
    }

    #[test]
    fn builds_tls_secret() {
        let secret = build_tls_secret(&request(Some("default"), "app-tls"), b"cert", b"key")
            .unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("app-tls"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE_TLS));
        let data = secret.data.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.get(FILE_PEM_CERT_CERT), Some(&ByteString(b"cert".to_vec())));
        assert_eq!(data.get(FILE_PEM_CERT_KEY), Some(&ByteString(b"key".to_vec())));
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "CertificateRequest");
        assert_eq!(owners[0].uid, "1234");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn rejects_incomplete_requests() {
        assert!(matches!(
            build_tls_secret(&request(None, "app-tls"), b"cert", b"key"),
            Err(Error::NoNamespace)
        ));
        assert!(matches!(
            build_tls_secret(&request(Some("default"), ""), b"cert", b"key"),
            Err(Error::NoSecretName)
        ));
    }

    #[test]
    fn rejects_partial_payloads() {
        let cr = request(Some("default"), "app-tls");
        assert!(matches!(
            build_tls_secret(&cr, b"", b"key"),
            Err(Error::EmptyCertificate { .. })
        ));
        assert!(matches!(
            build_tls_secret(&cr, b"cert", b""),
            Err(Error::EmptyPrivateKey { .. })
        ));
    }
}
