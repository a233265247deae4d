//! Drives [`CertificateRequest`]s through their issuance lifecycle
//!
//! Each pass re-reads the request and acts on its stored phase:
//!
//! - unset: the request is marked `Pending`
//! - `Pending`: the certificate is obtained and stored as a Secret, the request ends up `Approved`
//!   or `Failed`
//! - anything else is left alone, except for unrecognized phases which are marked `Failed`
//!
//! The outcome of every step is appended to the request's condition log.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{future, StreamExt};
use kube_acme_crd_utils::NamespacedName;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::chrono::Utc,
    kube::{
        api::DynamicObject,
        runtime::{
            controller::{self, Action},
            reflector::ObjectRef,
            watcher, Controller,
        },
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    acme::{dns::Credentials, CertificateAuthority, IssuedCertificate, ObtainRequest},
    crd::{
        CertificateRequest, CertificateRequestCondition, CertificateRequestConditionType,
        CertificateRequestPhase,
    },
    secret::{build_tls_secret, secret_reference},
    store::{self, CreateOutcome, ObjectStore},
    utils::error_full_message,
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certificaterequest";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const REASON_DNS_PROVIDER_LOOKUP_FAILED: &str = "DNSProviderLookupFailed";
pub const REASON_OBTAIN_CERTIFICATE_DONE: &str = "ObtainCertificateDone";
pub const REASON_OBTAIN_CERTIFICATE_FAILED: &str = "ObtainCertificateFailed";
pub const REASON_CONSTRUCT_SECRET_DONE: &str = "ConstructCertificateSecretDone";
pub const REASON_CONSTRUCT_SECRET_FAILED: &str = "ConstructCertificateSecretFailed";
pub const REASON_SYNC_SECRET_DONE: &str = "SyncCertificateSecretDone";
pub const REASON_SYNC_SECRET_FAILED: &str = "SyncCertificateSecretFailed";
pub const REASON_UNRECOGNIZED_PHASE: &str = "UnrecognizedPhase";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("CertificateRequest has no name or namespace"))]
    NoKey,

    #[snafu(display("failed to read CertificateRequest"))]
    GetCertificateRequest { source: store::Error },

    #[snafu(display("failed to persist status of CertificateRequest"))]
    UpdateStatus { source: store::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::NoKey => None,
            Error::GetCertificateRequest { source } | Error::UpdateStatus { source } => {
                source.object().cloned()
            }
        }
    }
}

/// What the driver should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    /// Run another pass right away instead of waiting for the next change.
    pub requeue: bool,
}

impl Directive {
    const DONE: Self = Self { requeue: false };
    const REQUEUE: Self = Self { requeue: true };
}

/// A failed step, recorded as a `False` condition.
struct StepFailure {
    condition: CertificateRequestCondition,
}

impl StepFailure {
    fn new(
        type_: CertificateRequestConditionType,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition: CertificateRequestCondition::failed(type_, reason, message),
        }
    }
}

/// Runs one reconciliation pass for the CertificateRequest at `key`.
#[tracing::instrument(skip(store, authority), fields(certificate_request = %key))]
pub async fn reconcile_pass<S, A>(
    store: &S,
    authority: &A,
    key: &NamespacedName,
) -> Result<Directive, Error>
where
    S: ObjectStore + ?Sized,
    A: CertificateAuthority + ?Sized,
{
    let Some(mut cr) = store
        .get_certificate_request(key)
        .await
        .context(GetCertificateRequestSnafu)?
    else {
        tracing::debug!("CertificateRequest no longer exists");
        return Ok(Directive::DONE);
    };

    match cr.phase().cloned() {
        None => {
            tracing::info!("accepting new CertificateRequest");
            cr.status_mut().phase = Some(CertificateRequestPhase::Pending);
            store
                .replace_certificate_request_status(&cr)
                .await
                .context(UpdateStatusSnafu)?;
            Ok(Directive::REQUEUE)
        }
        Some(CertificateRequestPhase::Pending) => {
            process_pending(store, authority, key, cr).await?;
            Ok(Directive::DONE)
        }
        Some(
            CertificateRequestPhase::Approving
            | CertificateRequestPhase::Approved
            | CertificateRequestPhase::Denied
            | CertificateRequestPhase::Failed,
        ) => Ok(Directive::DONE),
        Some(CertificateRequestPhase::Unrecognized(phase)) => {
            let failure = StepFailure::new(
                CertificateRequestConditionType::CertificateObtained,
                REASON_UNRECOGNIZED_PHASE,
                format!("unrecognized phase {phase:?}"),
            );
            fail(store, cr, failure).await?;
            Ok(Directive::DONE)
        }
    }
}

async fn process_pending<S, A>(
    store: &S,
    authority: &A,
    key: &NamespacedName,
    mut cr: CertificateRequest,
) -> Result<(), Error>
where
    S: ObjectStore + ?Sized,
    A: CertificateAuthority + ?Sized,
{
    let provider_key = NamespacedName::new(&key.namespace, &cr.spec.dns_provider_ref);
    let provider = match store.get_dns_provider(&provider_key).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            let failure = StepFailure::new(
                CertificateRequestConditionType::CertificateObtained,
                REASON_DNS_PROVIDER_LOOKUP_FAILED,
                format!("DNSProvider {provider_key} not found"),
            );
            return fail(store, cr, failure).await;
        }
        Err(err) => {
            let failure = StepFailure::new(
                CertificateRequestConditionType::CertificateObtained,
                REASON_DNS_PROVIDER_LOOKUP_FAILED,
                error_full_message(&err),
            );
            return fail(store, cr, failure).await;
        }
    };

    tracing::info!(
        domain = cr.spec.domain,
        provider = %provider.spec.code,
        "obtaining certificate"
    );
    let credentials = Credentials::new(provider.spec.keys.clone());
    let obtained = authority
        .obtain(&ObtainRequest {
            domain: &cr.spec.domain,
            provider: provider.spec.code,
            credentials: &credentials,
            email: &provider.spec.email,
        })
        .await;

    // Obtaining may take minutes, continue from the newest version of the request
    match store
        .get_certificate_request(key)
        .await
        .context(GetCertificateRequestSnafu)?
    {
        Some(latest) if latest.phase() == Some(&CertificateRequestPhase::Pending) => cr = latest,
        Some(latest) => {
            tracing::info!(
                phase = latest.phase().map(CertificateRequestPhase::as_str),
                "CertificateRequest was advanced concurrently, abandoning pass"
            );
            return Ok(());
        }
        None => {
            tracing::info!("CertificateRequest was deleted while obtaining certificate");
            return Ok(());
        }
    }

    let issued = match obtained {
        Ok(issued) => issued,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to obtain certificate"
            );
            let failure = StepFailure::new(
                CertificateRequestConditionType::CertificateObtained,
                REASON_OBTAIN_CERTIFICATE_FAILED,
                error_full_message(&err),
            );
            return fail(store, cr, failure).await;
        }
    };
    record(
        &mut cr,
        CertificateRequestCondition::succeeded(
            CertificateRequestConditionType::CertificateObtained,
            REASON_OBTAIN_CERTIFICATE_DONE,
        ),
    );
    cr.status_mut().phase = Some(CertificateRequestPhase::Approving);

    if let Err(failure) = materialize(store, &mut cr, &issued).await {
        return fail(store, cr, failure).await;
    }

    tracing::info!("certificate is available");
    cr.status_mut().phase = Some(CertificateRequestPhase::Approved);
    store
        .replace_certificate_request_status(&cr)
        .await
        .context(UpdateStatusSnafu)?;
    Ok(())
}

/// Builds the TLS Secret for `issued` and creates it unless it already exists.
async fn materialize<S>(
    store: &S,
    cr: &mut CertificateRequest,
    issued: &IssuedCertificate,
) -> Result<(), StepFailure>
where
    S: ObjectStore + ?Sized,
{
    let secret = build_tls_secret(
        cr,
        issued.certificate_pem.as_bytes(),
        issued.private_key_pem.as_bytes(),
    )
    .map_err(|err| {
        StepFailure::new(
            CertificateRequestConditionType::CertificateSecretConstructed,
            REASON_CONSTRUCT_SECRET_FAILED,
            error_full_message(&err),
        )
    })?;
    record(
        cr,
        CertificateRequestCondition::succeeded(
            CertificateRequestConditionType::CertificateSecretConstructed,
            REASON_CONSTRUCT_SECRET_DONE,
        ),
    );

    let sync_failed = |err: &dyn std::error::Error| {
        StepFailure::new(
            CertificateRequestConditionType::CertificateSecretSynced,
            REASON_SYNC_SECRET_FAILED,
            error_full_message(err),
        )
    };
    let secret_key = secret_reference(cr)
        .map(NamespacedName::from)
        .map_err(|err| sync_failed(&err))?;
    let existing = store
        .get_secret(&secret_key)
        .await
        .map_err(|err| sync_failed(&err))?;
    if existing.is_some() {
        tracing::info!(secret = %secret_key, "Secret already exists, keeping it");
    } else {
        match store
            .create_secret(&secret)
            .await
            .map_err(|err| sync_failed(&err))?
        {
            CreateOutcome::Created => tracing::info!(secret = %secret_key, "created Secret"),
            CreateOutcome::AlreadyExists => {
                tracing::info!(secret = %secret_key, "Secret was created concurrently, keeping it")
            }
        }
    }
    record(
        cr,
        CertificateRequestCondition::succeeded(
            CertificateRequestConditionType::CertificateSecretSynced,
            REASON_SYNC_SECRET_DONE,
        ),
    );
    Ok(())
}

fn record(cr: &mut CertificateRequest, condition: CertificateRequestCondition) {
    cr.status_mut().conditions.record(condition, Utc::now());
}

/// Persists `failure` and moves `cr` to `Failed`.
async fn fail<S>(store: &S, mut cr: CertificateRequest, failure: StepFailure) -> Result<(), Error>
where
    S: ObjectStore + ?Sized,
{
    tracing::warn!(
        condition = %failure.condition.type_,
        reason = failure.condition.reason,
        message = failure.condition.message,
        "CertificateRequest failed"
    );
    record(&mut cr, failure.condition);
    cr.status_mut().phase = Some(CertificateRequestPhase::Failed);
    store
        .replace_certificate_request_status(&cr)
        .await
        .context(UpdateStatusSnafu)?;
    Ok(())
}

pub struct Ctx<S, A> {
    pub store: S,
    pub authority: A,
    pub error_requeue: Duration,
}

pub async fn start<S, A>(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    ctx: Arc<Ctx<S, A>>,
    concurrency: u16,
) where
    S: ObjectStore + 'static,
    A: CertificateAuthority + 'static,
{
    Controller::new(
        watch_namespace.get_api::<CertificateRequest>(client),
        watcher::Config::default(),
    )
    .with_config(controller::Config::default().concurrency(concurrency))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|res| {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res);
        future::ready(())
    })
    .await;
}

async fn reconcile<S, A>(
    cr: Arc<CertificateRequest>,
    ctx: Arc<Ctx<S, A>>,
) -> Result<Action, Error>
where
    S: ObjectStore,
    A: CertificateAuthority,
{
    let key = NamespacedName::from_meta(&cr.metadata).context(NoKeySnafu)?;
    let directive = reconcile_pass(&ctx.store, &ctx.authority, &key).await?;
    Ok(if directive.requeue {
        Action::requeue(Duration::ZERO)
    } else {
        Action::await_change()
    })
}

fn error_policy<S, A>(
    _obj: Arc<CertificateRequest>,
    _error: &Error,
    ctx: Arc<Ctx<S, A>>,
) -> Action {
    Action::requeue(ctx.error_requeue)
}
