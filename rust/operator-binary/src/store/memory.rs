//! In-process [`ObjectStore`] used by the controller tests.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use kube_acme_crd_utils::NamespacedName;
use snafu::{OptionExt, ResultExt};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{self, api::ObjectMeta, error::ErrorResponse},
};

use super::{
    ConflictSnafu, CreateOutcome, CreateSnafu, GetSnafu, MissingKeySnafu, ObjectStore, Result,
};
use crate::crd::{CertificateRequest, CertificateRequestPhase, DnsProvider};

#[derive(Default)]
struct State {
    resource_version: u64,
    certificate_requests: BTreeMap<NamespacedName, CertificateRequest>,
    dns_providers: BTreeMap<NamespacedName, DnsProvider>,
    secrets: BTreeMap<NamespacedName, Secret>,
    secret_creates: usize,
    certificate_request_creates: usize,
    status_writes: Vec<Option<CertificateRequestPhase>>,
    conflict_next_status_write: bool,
    fail_next_dns_provider_get: bool,
    fail_next_secret_create: bool,
    race_next_secret_create: bool,
    fail_next_certificate_request_create: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn key_of(meta: &ObjectMeta) -> NamespacedName {
    NamespacedName::from_meta(meta).expect("missing key")
}

/// The error the API server returns when it is overloaded.
fn unavailable() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "the server is currently unable to handle the request".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    })
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    /// Stores `cr` as if it had been created through the API, assigning a UID and resourceVersion.
    pub fn insert_certificate_request(&self, mut cr: CertificateRequest) -> NamespacedName {
        let key = key_of(&cr.metadata);
        let mut state = self.state();
        cr.metadata.uid = Some(format!("uid-{}", key.name));
        cr.metadata.resource_version = Some(state.next_version());
        state.certificate_requests.insert(key.clone(), cr);
        key
    }

    pub fn insert_dns_provider(&self, provider: DnsProvider) {
        let key = key_of(&provider.metadata);
        self.state().dns_providers.insert(key, provider);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = key_of(&secret.metadata);
        self.state().secrets.insert(key, secret);
    }

    pub fn certificate_request(&self, key: &NamespacedName) -> Option<CertificateRequest> {
        self.state().certificate_requests.get(key).cloned()
    }

    pub fn certificate_requests(&self) -> Vec<CertificateRequest> {
        let state = self.state();
        state.certificate_requests.values().cloned().collect()
    }

    pub fn secret(&self, key: &NamespacedName) -> Option<Secret> {
        self.state().secrets.get(key).cloned()
    }

    /// Overwrites the stored phase without going through the status subresource.
    pub fn set_phase(&self, key: &NamespacedName, phase: Option<CertificateRequestPhase>) {
        let mut state = self.state();
        let version = state.next_version();
        let cr = state
            .certificate_requests
            .get_mut(key)
            .expect("object must exist");
        cr.status_mut().phase = phase;
        cr.metadata.resource_version = Some(version);
    }

    /// Bumps the resourceVersion of a stored object, as a concurrent writer would.
    pub fn touch_certificate_request(&self, key: &NamespacedName) {
        let mut state = self.state();
        let version = state.next_version();
        if let Some(cr) = state.certificate_requests.get_mut(key) {
            cr.metadata.resource_version = Some(version);
        }
    }

    pub fn conflict_next_status_write(&self) {
        self.state().conflict_next_status_write = true;
    }

    pub fn fail_next_dns_provider_get(&self) {
        self.state().fail_next_dns_provider_get = true;
    }

    pub fn fail_next_secret_create(&self) {
        self.state().fail_next_secret_create = true;
    }

    /// Makes the next Secret create lose against an identical Secret created by someone else.
    pub fn race_next_secret_create(&self) {
        self.state().race_next_secret_create = true;
    }

    pub fn fail_next_certificate_request_create(&self) {
        self.state().fail_next_certificate_request_create = true;
    }

    pub fn secret_creates(&self) -> usize {
        self.state().secret_creates
    }

    pub fn certificate_request_creates(&self) -> usize {
        self.state().certificate_request_creates
    }

    /// Phases written through the status subresource, in order.
    pub fn status_writes(&self) -> Vec<Option<CertificateRequestPhase>> {
        self.state().status_writes.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_certificate_request(
        &self,
        key: &NamespacedName,
    ) -> Result<Option<CertificateRequest>> {
        Ok(self.certificate_request(key))
    }

    async fn get_dns_provider(&self, key: &NamespacedName) -> Result<Option<DnsProvider>> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_dns_provider_get) {
            return Err(unavailable()).context(GetSnafu {
                object: key.object_ref::<DnsProvider>().erase(),
            });
        }
        Ok(state.dns_providers.get(key).cloned())
    }

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>> {
        Ok(self.secret(key))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome> {
        let key = NamespacedName::from_meta(&secret.metadata).context(MissingKeySnafu)?;
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_secret_create) {
            return Err(unavailable()).context(CreateSnafu {
                object: key.object_ref::<Secret>().erase(),
            });
        }
        if std::mem::take(&mut state.race_next_secret_create) {
            state.secrets.insert(key.clone(), secret.clone());
        }
        if state.secrets.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(state.next_version());
        state.secrets.insert(key, secret);
        state.secret_creates += 1;
        Ok(CreateOutcome::Created)
    }

    async fn create_certificate_request(&self, cr: &CertificateRequest) -> Result<CreateOutcome> {
        let key = NamespacedName::from_meta(&cr.metadata).context(MissingKeySnafu)?;
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_certificate_request_create) {
            return Err(unavailable()).context(CreateSnafu {
                object: key.object_ref::<CertificateRequest>().erase(),
            });
        }
        if state.certificate_requests.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut cr = cr.clone();
        cr.metadata.uid = Some(format!("uid-{}", key.name));
        cr.metadata.resource_version = Some(state.next_version());
        // Status is not writable through the main resource
        cr.status = None;
        state.certificate_requests.insert(key, cr);
        state.certificate_request_creates += 1;
        Ok(CreateOutcome::Created)
    }

    async fn replace_certificate_request_status(
        &self,
        cr: &CertificateRequest,
    ) -> Result<CertificateRequest> {
        let key = NamespacedName::from_meta(&cr.metadata).context(MissingKeySnafu)?;
        let object = || key.object_ref::<CertificateRequest>().erase();
        let mut state = self.state();
        if std::mem::take(&mut state.conflict_next_status_write) {
            return ConflictSnafu { object: object() }.fail();
        }
        let version = state.next_version();
        let stored = state
            .certificate_requests
            .get_mut(&key)
            .with_context(|| ConflictSnafu { object: object() })?;
        if stored.metadata.resource_version != cr.metadata.resource_version {
            return ConflictSnafu { object: object() }.fail();
        }
        stored.status = cr.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        let phase = updated.phase().cloned();
        state.status_writes.push(phase);
        Ok(updated)
    }
}
