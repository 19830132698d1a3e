//! Node readiness operator
//!
//! A Kubernetes operator that keeps declarative readiness rules consistent
//! with the scheduling taints on cluster nodes, and maintains a per-node
//! audit report of every rule's evaluation.

pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "admission-webhook")]
pub mod webhook;

pub use crate::error::{Error, Result};
