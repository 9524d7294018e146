//! Integration tests for index-verifier
//!
//! These tests require a running Kubernetes cluster accessible via kubeconfig.
//! Tests are marked with #[ignore] and must be run explicitly:
//!
//! ```bash
//! cargo test --test integration -- --ignored --test-threads=1
//! ```
//!
//! The tests use your existing kubeconfig (~/.kube/config or KUBECONFIG env var).
//! Each test works in its own namespace and pulls only `busybox`.

mod namespace;

mod tests;

pub use cluster::*;
pub use fixtures::*;
pub use namespace::*;
