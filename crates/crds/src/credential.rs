//! Credential CRD
//!
//! SSH public key record referenced by name from VirtualMachine specs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "Credential",
    shortname = "cred"
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSpec {
    /// SSH public key in authorized_keys format
    pub public_key: String,
}
