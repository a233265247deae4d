//! Small addressing types that are shared between the operator's controllers and CRDs.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef, Resource},
};

/// Address of a namespaced object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns `None` for objects that are missing either their name or their namespace.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }

    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// Redefine SecretReference instead of reusing k8s-openapi's, in order to make name/namespace mandatory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Namespace of the Secret being referred to.
    pub namespace: String,
    /// Name of the Secret being referred to.
    pub name: String,
}

// Use ObjectRef for logging/errors
impl Display for SecretReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ObjectRef::<Secret>::from(self).fmt(f)
    }
}

impl From<&SecretReference> for ObjectRef<Secret> {
    fn from(val: &SecretReference) -> Self {
        ObjectRef::<Secret>::new(&val.name).within(&val.namespace)
    }
}

impl From<SecretReference> for NamespacedName {
    fn from(val: SecretReference) -> Self {
        NamespacedName::new(val.namespace, val.name)
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::api::ObjectMeta;

    use super::{NamespacedName, SecretReference};

    #[test]
    fn namespaced_name_requires_both_parts() {
        let meta = ObjectMeta {
            name: Some("app-tls".to_string()),
            ..ObjectMeta::default()
        };
        assert_eq!(NamespacedName::from_meta(&meta), None);
        let meta = ObjectMeta {
            namespace: Some("default".to_string()),
            ..meta
        };
        assert_eq!(
            NamespacedName::from_meta(&meta),
            Some(NamespacedName::new("default", "app-tls"))
        );
    }

    #[test]
    fn secret_reference_converts_to_namespaced_name() {
        let secret_ref = SecretReference {
            namespace: "default".to_string(),
            name: "app-tls".to_string(),
        };
        assert_eq!(
            NamespacedName::from(secret_ref),
            NamespacedName::new("default", "app-tls")
        );
    }
}
