//! End-to-end tests for the VitalGuard device stack
//!
//! This test suite validates:
//! - Registration, clock sync and certificate lifecycle against a central server
//! - At-least-once telemetry delivery, spill-to-disk and restart recovery
//! - Audit chain continuity across restarts and tamper detection at startup

pub mod test_utils;

#[cfg(test)]
mod device_lifecycle_tests;

#[cfg(test)]
mod telemetry_delivery_tests;

#[cfg(test)]
mod audit_integrity_tests;
