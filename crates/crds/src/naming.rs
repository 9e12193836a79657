//! Naming and label schema shared by the controller and its dependents.
//!
//! Dependent resources carry no owner references; ownership is encoded in
//! the name (VM name + delimiter + role suffix) and in the label set. The
//! delimiter is injectable so tests can pick a scheme that cannot collide
//! with their fixture names.

use std::collections::BTreeMap;

/// Application tag shared by every resource this controller manages.
pub const LABEL_APP_VALUE: &str = "vmops";

/// Label key for the application tag.
pub const LABEL_APP: &str = "app";

/// Label key carrying the owning VM's name.
pub const LABEL_NAME: &str = "name";

/// Label key distinguishing compute, display-proxy and migration roles.
pub const LABEL_ROLE: &str = "role";

/// Role value for compute pods.
pub const ROLE_VM: &str = "vm";

/// Role value for the display-proxy pod and service.
pub const ROLE_NOVNC: &str = "novnc";

/// Role value for migration jobs.
pub const ROLE_MIGRATE: &str = "migrate";

/// Well-known node label used for placement affinity.
pub const LABEL_NODE_HOSTNAME: &str = "kubernetes.io/hostname";

/// Deterministic dependent-name derivation with a configurable delimiter.
#[derive(Debug, Clone, Copy)]
pub struct NameScheme {
    delimiter: char,
}

impl Default for NameScheme {
    fn default() -> Self {
        Self { delimiter: '-' }
    }
}

impl NameScheme {
    /// A scheme using the given delimiter between VM name and role suffix.
    #[must_use]
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    /// Prefix for compute pod `generateName`; the API server appends a
    /// unique suffix, which the reverse mapping strips off again.
    #[must_use]
    pub fn vm_pod_prefix(&self, vm_name: &str) -> String {
        format!("{vm_name}{}", self.delimiter)
    }

    /// Name of the display-proxy pod for a VM.
    #[must_use]
    pub fn novnc_pod_name(&self, vm_name: &str) -> String {
        format!("{vm_name}{}{ROLE_NOVNC}", self.delimiter)
    }

    /// Name of the display-proxy service for a VM.
    #[must_use]
    pub fn novnc_service_name(&self, vm_name: &str) -> String {
        self.novnc_pod_name(vm_name)
    }

    /// Name of the migration job for a VM.
    #[must_use]
    pub fn migration_job_name(&self, vm_name: &str) -> String {
        format!("{vm_name}{}{ROLE_MIGRATE}", self.delimiter)
    }

    /// Owning VM name for a dependent: everything before the last
    /// delimiter. `None` when the name carries no delimiter at all.
    #[must_use]
    pub fn owner_vm_name<'a>(&self, dependent_name: &'a str) -> Option<&'a str> {
        dependent_name
            .rfind(self.delimiter)
            .map(|idx| &dependent_name[..idx])
    }
}

/// Full label set for a dependent resource of a VM.
#[must_use]
pub fn labels_for(vm_name: &str, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_NAME.to_string(), vm_name.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
    ])
}

/// Selector matching every pod of a VM regardless of role.
#[must_use]
pub fn vm_name_selector(vm_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_NAME.to_string(), vm_name.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependent_names_round_trip() {
        let scheme = NameScheme::default();
        assert_eq!(scheme.novnc_pod_name("v1"), "v1-novnc");
        assert_eq!(scheme.migration_job_name("v1"), "v1-migrate");
        assert_eq!(scheme.owner_vm_name("v1-novnc"), Some("v1"));
        assert_eq!(scheme.owner_vm_name("v1-migrate"), Some("v1"));
    }

    #[test]
    fn test_owner_name_strips_last_segment_only() {
        let scheme = NameScheme::default();
        // VM names may themselves contain the delimiter.
        assert_eq!(scheme.owner_vm_name("my-vm-8fk2c"), Some("my-vm"));
    }

    #[test]
    fn test_owner_name_without_delimiter() {
        let scheme = NameScheme::default();
        assert_eq!(scheme.owner_vm_name("plain"), None);
    }

    #[test]
    fn test_injected_delimiter() {
        let scheme = NameScheme::new('.');
        assert_eq!(scheme.vm_pod_prefix("v1"), "v1.");
        assert_eq!(scheme.novnc_pod_name("v1"), "v1.novnc");
        assert_eq!(scheme.owner_vm_name("v1.migrate"), Some("v1"));
        // A '-' in the name is no longer significant.
        assert_eq!(scheme.owner_vm_name("v1-migrate"), None);
    }

    #[test]
    fn test_labels_for_role() {
        let labels = labels_for("v1", ROLE_VM);
        assert_eq!(labels.get(LABEL_APP).map(String::as_str), Some("vmops"));
        assert_eq!(labels.get(LABEL_NAME).map(String::as_str), Some("v1"));
        assert_eq!(labels.get(LABEL_ROLE).map(String::as_str), Some("vm"));
    }
}
