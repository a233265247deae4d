//! Derives [`CertificateRequest`]s from annotated [`Ingress`]es
//!
//! An Ingress opts in by naming a DNSProvider in the [`ANNOTATION_DNS_PROVIDER`] annotation. The
//! first TLS block decides the domain and the target Secret. Requests are created once and are
//! never updated or deleted afterwards.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{future, StreamExt};
use kube_acme_crd_utils::NamespacedName;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::networking::v1::Ingress,
    kube::{
        api::{DynamicObject, ObjectMeta},
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    crd::{CertificateRequest, CertificateRequestSpec, DnsProvider},
    store::{self, CreateOutcome, ObjectStore},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "ingress";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const ANNOTATION_DNS_PROVIDER: &str = "kube-acme.ketches.cn/dns-provider";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to look up DNSProvider {provider}"))]
    GetDnsProvider {
        source: store::Error,
        provider: NamespacedName,
    },

    #[snafu(display("DNSProvider {provider} does not exist"))]
    DnsProviderNotFound { provider: NamespacedName },

    #[snafu(display("failed to create CertificateRequest {certificate_request}"))]
    CreateCertificateRequest {
        source: store::Error,
        certificate_request: NamespacedName,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetDnsProvider { provider, .. } | Error::DnsProviderNotFound { provider } => {
                Some(provider.object_ref::<DnsProvider>().erase())
            }
            Error::CreateCertificateRequest {
                certificate_request,
                ..
            } => {
                let object = certificate_request.object_ref::<CertificateRequest>();
                Some(object.erase())
            }
        }
    }
}

/// Why an Ingress does not get a CertificateRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SkipReason {
    #[strum(serialize = "no DNSProvider annotation")]
    NoAnnotation,
    #[strum(serialize = "DNSProvider annotation is empty")]
    EmptyAnnotation,
    #[strum(serialize = "Ingress has no namespace")]
    NoNamespace,
    #[strum(serialize = "Ingress declares no TLS block")]
    NoTls,
    #[strum(serialize = "first TLS block declares no host")]
    NoTlsHost,
    #[strum(serialize = "first TLS block declares no secretName")]
    NoSecretName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    Created(NamespacedName),
    /// A CertificateRequest of the same name existed already.
    AlreadyDerived(NamespacedName),
    Skipped(SkipReason),
}

/// Builds the CertificateRequest that `ingress` asks for.
pub fn derive_certificate_request(ingress: &Ingress) -> Result<CertificateRequest, SkipReason> {
    let provider = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_DNS_PROVIDER))
        .ok_or(SkipReason::NoAnnotation)?;
    if provider.is_empty() {
        return Err(SkipReason::EmptyAnnotation);
    }
    let namespace = ingress
        .metadata
        .namespace
        .as_ref()
        .ok_or(SkipReason::NoNamespace)?;
    let tls = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.tls.as_ref())
        .and_then(|tls| tls.first())
        .ok_or(SkipReason::NoTls)?;
    let domain = tls
        .hosts
        .as_ref()
        .and_then(|hosts| hosts.first())
        .filter(|host| !host.is_empty())
        .ok_or(SkipReason::NoTlsHost)?;
    let secret_name = tls
        .secret_name
        .as_ref()
        .filter(|name| !name.is_empty())
        .ok_or(SkipReason::NoSecretName)?;

    Ok(CertificateRequest {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: CertificateRequestSpec {
            domain: domain.clone(),
            secret_name: secret_name.clone(),
            dns_provider_ref: provider.clone(),
        },
        status: None,
    })
}

#[tracing::instrument(skip(store, ingress), fields(ingress = ingress.metadata.name.as_deref()))]
pub async fn reconcile_ingress<S>(store: &S, ingress: &Ingress) -> Result<Derivation, Error>
where
    S: ObjectStore + ?Sized,
{
    let cr = match derive_certificate_request(ingress) {
        Ok(cr) => cr,
        Err(reason) => {
            tracing::debug!(%reason, "not deriving a CertificateRequest");
            return Ok(Derivation::Skipped(reason));
        }
    };
    // Both are set by derive_certificate_request
    let Some(key) = NamespacedName::from_meta(&cr.metadata) else {
        return Ok(Derivation::Skipped(SkipReason::NoNamespace));
    };

    let provider = NamespacedName::new(&key.namespace, &cr.spec.dns_provider_ref);
    store
        .get_dns_provider(&provider)
        .await
        .with_context(|_| GetDnsProviderSnafu {
            provider: provider.clone(),
        })?
        .with_context(|| DnsProviderNotFoundSnafu {
            provider: provider.clone(),
        })?;

    match store
        .create_certificate_request(&cr)
        .await
        .with_context(|_| CreateCertificateRequestSnafu {
            certificate_request: key.clone(),
        })? {
        CreateOutcome::Created => {
            tracing::info!(
                certificate_request = %key,
                domain = cr.spec.domain,
                "created CertificateRequest"
            );
            Ok(Derivation::Created(key))
        }
        CreateOutcome::AlreadyExists => {
            tracing::debug!(certificate_request = %key, "CertificateRequest already exists");
            Ok(Derivation::AlreadyDerived(key))
        }
    }
}

pub struct Ctx<S> {
    pub store: S,
    pub error_requeue: Duration,
}

pub async fn start<S>(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx<S>>,
) where
    S: ObjectStore + 'static,
{
    Controller::new(
        watch_namespace.get_api::<Ingress>(client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res);
        future::ready(())
    })
    .await;
}

async fn reconcile<S: ObjectStore>(
    ingress: Arc<Ingress>,
    ctx: Arc<Ctx<S>>,
) -> Result<Action, Error> {
    reconcile_ingress(&ctx.store, &ingress).await?;
    Ok(Action::await_change())
}

fn error_policy<S>(_obj: Arc<Ingress>, _error: &Error, ctx: Arc<Ctx<S>>) -> Action {
    Action::requeue(ctx.error_requeue)
}
