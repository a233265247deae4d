pub mod acme;
pub mod certificate_request_controller;
pub mod crd;
pub mod ingress_controller;
pub mod secret;
pub mod store;
pub mod utils;

pub const APP_NAME: &str = "kube-acme";
pub const OPERATOR_NAME: &str = "kube-acme-operator";
/// Field manager for all writes to the Kubernetes API.
pub const FIELD_MANAGER: &str = "kube-acme.ketches.cn";
