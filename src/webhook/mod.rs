//! Admission webhook for NodeReadinessRules
//!
//! Rejects specs the reconcilers could not act on sensibly and enforces the
//! cross-rule (taint key, effect) uniqueness guarantee. The reconcilers stay
//! correct without it; it exists to catch mistakes before they reach them.

mod server;
mod validation;

pub use server::run_server;
pub use validation::{check_taint_uniqueness, spec_warnings, validate_spec, ValidationIssue};
