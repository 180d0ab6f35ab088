//! Shared constants for end-to-end tests

#![allow(dead_code)]

use std::time::Duration;

/// Account followed by most tests
pub const PATIENT_ID: &str = "patient-1";

/// Second account, used to check isolation
pub const DOCTOR_ID: &str = "doctor-7";

/// Upper bound for any wait on asynchronous state
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
