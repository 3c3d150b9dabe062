//! Device identity and certificate lifecycle for VitalGuard bedside devices.
//!
//! This crate owns everything that proves to the central server who the
//! device is: the server-assigned identity, the auth credential, and the
//! certificates used for mutual authentication and code signing.
//!
//! # Core Concepts
//!
//! - **Registration**: one-time (or explicitly reprovisioned) enrollment with
//!   the central server
//! - **Certificate Lifecycle**: Pending → Active → ExpiringSoon → Expired,
//!   with Revoked and Superseded as terminal side exits
//! - **Rotation**: replacement certificates are validated and activated
//!   atomically, so a type never goes without an in-service certificate
//!
//! # Security Model
//!
//! - Certificates are trusted only if signed by a configured trust anchor
//! - Private keys and auth tokens are sealed at rest with the datastore key
//! - Every lifecycle transition lands in the audit chain

pub mod cert_manager;
pub mod cert_store;
pub mod device;
pub mod error;
pub mod pki;
pub mod registration;

pub use cert_manager::{
    ActiveCertificates, CertificateIssuer, CertificateManager, ClientCredentials, IssueRequest,
};
pub use cert_store::CertificateStore;
pub use device::{Credential, DeviceIdentity, HardwareInfo, IdentityStore};
pub use error::{IdentityError, IdentityResult};
pub use pki::{
    Certificate, CertificateAuthority, CertificateMaterial, CertificateStatus, CertificateType,
    TrustAnchors, ValidityReport,
};
pub use registration::{
    ChannelIssuer, DeviceRegistration, RefusalCode, RegistrationChannel, RegistrationError,
    RegistrationGrant, RegistrationRequest, RegistrationResponse, RegistrationStatus,
    RenewalRequest, RenewalResponse,
};
