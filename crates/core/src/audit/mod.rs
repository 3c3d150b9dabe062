//! Tamper-evident audit log.

mod chain;
mod entry;

pub use chain::{AuditChain, AuditError, ChainHealth};
pub use entry::{
    compute_entry_hash, payload_hash, AuditEntry, AuditEventType, Hash256, GENESIS_HASH,
};
