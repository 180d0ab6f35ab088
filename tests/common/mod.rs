//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{notification, TestHarness, PATIENT_ID};
//!
//! #[tokio::test]
//! async fn test_push_insert() {
//!     let harness = TestHarness::new();
//!     let handle = harness.subscribe_patient().await;
//!     harness.backend.insert(notification("n-1", PATIENT_ID, 10)).await;
//!     common::wait_for_len(&handle, 1).await;
//! }
//! ```

mod constants;
mod fixtures;
mod harness;

#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::{notification, read_notification, RecordingListener};
#[allow(unused_imports)]
pub use harness::{wait_for_len, wait_for_state, wait_for_view, TestHarness};
