//! Access to the Kubernetes objects that the controllers read and write
//!
//! The controllers only need get/create and status replacement, with optimistic concurrency
//! conflicts surfaced as a distinct error instead of being retried in-process.

use std::fmt::Debug;

use async_trait::async_trait;
use kube_acme_crd_utils::NamespacedName;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, NamespaceResourceScope},
    kube::{
        self,
        api::{Api, DynamicObject, PostParams},
        runtime::reflector::ObjectRef,
        Resource,
    },
};

use crate::crd::{CertificateRequest, DnsProvider};

#[cfg(test)]
pub mod memory;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to create {object}"))]
    Create {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: ObjectRef<DynamicObject> },

    #[snafu(display("failed to update status of {object}"))]
    UpdateStatus {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("object has no name or namespace"))]
    MissingKey,
}

impl Error {
    pub fn object(&self) -> Option<&ObjectRef<DynamicObject>> {
        match self {
            Error::Get { object, .. }
            | Error::Create { object, .. }
            | Error::Conflict { object }
            | Error::UpdateStatus { object, .. }
            | Error::Serialize { object, .. } => Some(object),
            Error::MissingKey => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of a create call that raced against an identically named object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_certificate_request(
        &self,
        key: &NamespacedName,
    ) -> Result<Option<CertificateRequest>>;

    async fn get_dns_provider(&self, key: &NamespacedName) -> Result<Option<DnsProvider>>;

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome>;

    async fn create_certificate_request(&self, cr: &CertificateRequest) -> Result<CreateOutcome>;

    /// Writes the status subresource of `cr`.
    ///
    /// The write is conditional on `cr`'s `resourceVersion`, a stale object fails with
    /// [`Error::Conflict`].
    async fn replace_certificate_request_status(
        &self,
        cr: &CertificateRequest,
    ) -> Result<CertificateRequest>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_opt<K>(&self, key: &NamespacedName) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
        K::DynamicType: Default,
    {
        self.api::<K>(&key.namespace)
            .get_opt(&key.name)
            .await
            .with_context(|_| GetSnafu {
                object: key.object_ref::<K>().erase(),
            })
    }

    async fn create<K>(&self, obj: &K) -> Result<CreateOutcome>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned + Serialize,
        K::DynamicType: Default,
    {
        let key = NamespacedName::from_meta(obj.meta()).context(MissingKeySnafu)?;
        match self
            .api::<K>(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(source) => Err(Error::Create {
                source,
                object: key.object_ref::<K>().erase(),
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_certificate_request(
        &self,
        key: &NamespacedName,
    ) -> Result<Option<CertificateRequest>> {
        self.get_opt(key).await
    }

    async fn get_dns_provider(&self, key: &NamespacedName) -> Result<Option<DnsProvider>> {
        self.get_opt(key).await
    }

    async fn get_secret(&self, key: &NamespacedName) -> Result<Option<Secret>> {
        self.get_opt(key).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome> {
        self.create(secret).await
    }

    async fn create_certificate_request(&self, cr: &CertificateRequest) -> Result<CreateOutcome> {
        self.create(cr).await
    }

    async fn replace_certificate_request_status(
        &self,
        cr: &CertificateRequest,
    ) -> Result<CertificateRequest> {
        let key = NamespacedName::from_meta(&cr.metadata).context(MissingKeySnafu)?;
        let object = || key.object_ref::<CertificateRequest>().erase();
        let data = serde_json::to_vec(cr).with_context(|_| SerializeSnafu { object: object() })?;
        match self
            .api::<CertificateRequest>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                ConflictSnafu { object: object() }.fail()
            }
            Err(source) => Err(Error::UpdateStatus {
                source,
                object: object(),
            }),
        }
    }
}
