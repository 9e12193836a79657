//! vmops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the vmops controllers, plus
//! the naming and label schema tying dependent resources to their VM.

pub mod credential;
pub mod naming;
pub mod virtual_machine;

pub use credential::*;
pub use virtual_machine::*;
