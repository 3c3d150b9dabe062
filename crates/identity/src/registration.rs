//! Device registration and credential renewal.
//!
//! Registration presents the hardware metadata and a fresh device key to the
//! central server, receives the device id, an auth token and the initial
//! certificates, and persists all of it. A new credential is stored before
//! older ones are discarded, and older ones are only discarded once the new
//! ClientAuth certificate is Active.

use crate::cert_manager::{CertificateIssuer, CertificateManager, IssueRequest};
use crate::device::{Credential, DeviceIdentity, HardwareInfo, IdentityStore};
use crate::error::{IdentityError, IdentityResult};
use crate::pki::{Certificate, CertificateMaterial, CertificateType};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vitalguard_core::{
    with_timeout, AuditChain, AuditError, AuditEventType, ChannelError, Classify, CorrectedClock,
    ErrorClass, Notification, NotificationBus, RetryError, RetryPolicy,
};
use vitalguard_crypto::DeviceKeyPair;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub hardware: HardwareInfo,
    pub public_key: Vec<u8>,
    /// Device id being replaced, when reprovisioning
    pub previous_device_id: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationGrant {
    pub device_id: String,
    pub auth_token: String,
    pub token_expires_at_ms: i64,
    pub client_certificate: Certificate,
    pub server_trust: Option<Certificate>,
}

impl fmt::Debug for RegistrationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationGrant")
            .field("device_id", &self.device_id)
            .field("client_certificate", &self.client_certificate.id)
            .finish_non_exhaustive()
    }
}

/// Server refusal codes. None of them are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalCode {
    Rejected,
    AlreadyRegistered,
    InvalidMetadata,
}

impl fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefusalCode::Rejected => "Rejected",
            RefusalCode::AlreadyRegistered => "AlreadyRegistered",
            RefusalCode::InvalidMetadata => "InvalidMetadata",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationResponse {
    Granted(RegistrationGrant),
    Refused { code: RefusalCode, message: String },
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalRequest {
    pub device_id: String,
    pub auth_token: String,
    pub cert_type: CertificateType,
    pub subject: String,
    pub public_key: Option<Vec<u8>>,
}

impl fmt::Debug for RenewalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalRequest")
            .field("device_id", &self.device_id)
            .field("cert_type", &self.cert_type)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalResponse {
    Issued(Certificate),
    Refused { code: RefusalCode, message: String },
}

/// Connection to the central registration/issuance service.
#[async_trait]
pub trait RegistrationChannel: Send + Sync {
    async fn register(&self, request: RegistrationRequest)
        -> Result<RegistrationResponse, ChannelError>;

    async fn renew(&self, request: RenewalRequest) -> Result<RenewalResponse, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    InProgress { attempt: u32 },
    Registered { device_id: String },
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Registration already in progress")]
    AlreadyInProgress,

    #[error("Device already provisioned as {device_id}")]
    AlreadyProvisioned { device_id: String },

    #[error("Server refused registration ({code}): {message}")]
    Refused { code: RefusalCode, message: String },

    #[error("Registration channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Registration gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ChannelError },

    #[error("Registration cancelled")]
    Cancelled,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl Classify for RegistrationError {
    fn class(&self) -> ErrorClass {
        match self {
            RegistrationError::Channel(e) => e.class(),
            RegistrationError::Identity(e) => e.class(),
            RegistrationError::Audit(e) => e.class(),
            RegistrationError::AlreadyInProgress
            | RegistrationError::AlreadyProvisioned { .. }
            | RegistrationError::Refused { .. } => ErrorClass::Validation,
            RegistrationError::Exhausted { .. } | RegistrationError::Cancelled => {
                ErrorClass::Transient
            }
        }
    }
}

/// Clears the in-flight flag when registration ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeviceRegistration {
    channel: Arc<dyn RegistrationChannel>,
    identity: Arc<IdentityStore>,
    certificates: Arc<CertificateManager>,
    clock: Arc<CorrectedClock>,
    audit: Arc<AuditChain>,
    notifications: NotificationBus,
    retry: RetryPolicy,
    hardware: HardwareInfo,
    timeout: Duration,
    in_flight: AtomicBool,
    status: ArcSwap<RegistrationStatus>,
}

impl DeviceRegistration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Arc<dyn RegistrationChannel>,
        identity: Arc<IdentityStore>,
        certificates: Arc<CertificateManager>,
        clock: Arc<CorrectedClock>,
        audit: Arc<AuditChain>,
        notifications: NotificationBus,
        retry: RetryPolicy,
        hardware: HardwareInfo,
        timeout: Duration,
    ) -> IdentityResult<Self> {
        let initial = match identity.device_identity()? {
            Some(existing) => RegistrationStatus::Registered {
                device_id: existing.device_id,
            },
            None => RegistrationStatus::Unregistered,
        };
        Ok(Self {
            channel,
            identity,
            certificates,
            clock,
            audit,
            notifications,
            retry,
            hardware,
            timeout,
            in_flight: AtomicBool::new(false),
            status: ArcSwap::from_pointee(initial),
        })
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status.load().as_ref().clone()
    }

    fn set_status(&self, status: RegistrationStatus) {
        self.status.store(Arc::new(status));
    }

    /// Stored identity, if the device has registered before.
    pub fn device_identity(&self) -> IdentityResult<Option<DeviceIdentity>> {
        self.identity.device_identity()
    }

    /// Register this device, or re-register it when `reprovision` is set.
    ///
    /// Only one registration runs at a time; a concurrent call fails with
    /// [`RegistrationError::AlreadyInProgress`].
    pub async fn register_device(
        &self,
        reprovision: bool,
        cancel: &CancellationToken,
    ) -> Result<DeviceIdentity, RegistrationError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RegistrationError::AlreadyInProgress);
        }
        let _guard = InFlight(&self.in_flight);

        let existing = self.identity.device_identity()?;
        if !reprovision {
            if let Some(existing) = &existing {
                if self.certificates.active(CertificateType::ClientAuth).is_some() {
                    return Err(RegistrationError::AlreadyProvisioned {
                        device_id: existing.device_id.clone(),
                    });
                }
            }
        }
        self.hardware.validate()?;

        let key_pair = DeviceKeyPair::generate();
        let request = RegistrationRequest {
            hardware: self.hardware.clone(),
            public_key: key_pair.public_key().to_vec(),
            previous_device_id: existing.map(|e| e.device_id),
        };

        info!(
            serial_number = %self.hardware.serial_number,
            reprovision,
            "Registering device"
        );
        let result = self
            .retry
            .run(cancel, "device_registration", |attempt| {
                self.set_status(RegistrationStatus::InProgress {
                    attempt: attempt + 1,
                });
                self.attempt(&request)
            })
            .await;

        let grant = match result {
            Ok(grant) => grant,
            Err(RetryError::Cancelled { attempts }) => {
                info!(attempts, "Registration cancelled");
                self.set_status(RegistrationStatus::Unregistered);
                return Err(RegistrationError::Cancelled);
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let err = match last {
                    RegistrationError::Channel(last) => RegistrationError::Exhausted { attempts, last },
                    other => other,
                };
                return Err(self.fail(err, attempts)?);
            }
            Err(RetryError::Permanent { attempts, error }) => {
                return Err(self.fail(error, attempts)?);
            }
        };

        match self.complete(grant, &key_pair, reprovision) {
            Ok(identity) => Ok(identity),
            Err(e) => Err(self.fail(RegistrationError::Identity(e), 1)?),
        }
    }

    async fn attempt(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationGrant, RegistrationError> {
        let response = with_timeout(
            self.timeout,
            "registration",
            self.channel.register(request.clone()),
        )
        .await?;
        match response {
            RegistrationResponse::Granted(grant) => Ok(grant),
            RegistrationResponse::Refused { code, message } => {
                warn!(code = %code, message = %message, "Server refused registration");
                Err(RegistrationError::Refused { code, message })
            }
        }
    }

    /// Persist the grant. The credential goes in first; older credentials
    /// are dropped only after the new certificate is Active. A failure part
    /// way through undoes every earlier write, leaving the previous identity,
    /// credential and certificates as they were.
    fn complete(
        &self,
        grant: RegistrationGrant,
        key_pair: &DeviceKeyPair,
        reprovision: bool,
    ) -> IdentityResult<DeviceIdentity> {
        let now = self.clock.now();
        if grant.client_certificate.public_key != key_pair.public_key() {
            return Err(IdentityError::CertificateValidation {
                cert_id: grant.client_certificate.id.clone(),
                reason: "issued public key does not match the registration key".into(),
            });
        }
        if grant.client_certificate.cert_type != CertificateType::ClientAuth {
            return Err(IdentityError::CertificateValidation {
                cert_id: grant.client_certificate.id.clone(),
                reason: format!("expected ClientAuth, got {}", grant.client_certificate.cert_type),
            });
        }
        if !reprovision {
            if let Some(existing) = self.identity.device_identity()? {
                if existing.device_id != grant.device_id {
                    return Err(IdentityError::IdentityExists {
                        device_id: existing.device_id,
                    });
                }
            }
        }

        let credential = Credential {
            credential_id: format!("{}-{}", grant.device_id, now),
            device_id: grant.device_id.clone(),
            auth_token: grant.auth_token.clone(),
            issued_at_ms: now,
            expires_at_ms: grant.token_expires_at_ms,
        };
        self.identity.store_credential(&credential)?;

        // (installed cert id, ids it superseded), undone in reverse
        let mut installed: Vec<(String, Vec<String>)> = Vec::with_capacity(2);
        let client_cert_id = grant.client_certificate.id.clone();
        let result = self
            .certificates
            .install(
                grant.client_certificate.clone(),
                CertificateMaterial::with_private_key(key_pair),
            )
            .and_then(|superseded| {
                installed.push((client_cert_id.clone(), superseded));
                match &grant.server_trust {
                    Some(server) => {
                        let superseded = self
                            .certificates
                            .install(server.clone(), CertificateMaterial::public_only())?;
                        installed.push((server.id.clone(), superseded));
                        Ok(())
                    }
                    None => Ok(()),
                }
            })
            .and_then(|()| {
                let identity = DeviceIdentity {
                    device_id: grant.device_id.clone(),
                    serial_number: self.hardware.serial_number.clone(),
                    model: self.hardware.model.clone(),
                    firmware_version: self.hardware.firmware_version.clone(),
                    registered_at_ms: now,
                };
                self.identity.store_identity(&identity, reprovision)?;
                Ok(identity)
            });

        let identity = match result {
            Ok(identity) => identity,
            Err(e) => {
                if let Err(undo) = self.undo(&credential.credential_id, &installed) {
                    error!(error = %undo, "Failed to undo partial registration");
                }
                return Err(e);
            }
        };
        let discarded = self
            .identity
            .discard_credentials_except(&credential.credential_id)?;

        self.audit.append(
            AuditEventType::DeviceRegistered,
            &json!({
                "device_id": identity.device_id,
                "serial_number": identity.serial_number,
                "model": identity.model,
                "firmware_version": identity.firmware_version,
                "cert_id": client_cert_id,
                "reprovision": reprovision,
                "discarded_credentials": discarded,
            }),
        )?;
        self.set_status(RegistrationStatus::Registered {
            device_id: identity.device_id.clone(),
        });
        info!(device_id = %identity.device_id, "Device registered");
        Ok(identity)
    }

    fn undo(&self, credential_id: &str, installed: &[(String, Vec<String>)]) -> IdentityResult<()> {
        for (cert_id, superseded) in installed.iter().rev() {
            self.certificates.roll_back_install(cert_id, superseded)?;
        }
        self.identity.discard_credential(credential_id)?;
        warn!(
            credential_id,
            certificates = installed.len(),
            "Partial registration undone"
        );
        Ok(())
    }

    /// Record a failed registration and hand the error back.
    fn fail(
        &self,
        err: RegistrationError,
        attempts: u32,
    ) -> Result<RegistrationError, RegistrationError> {
        let reason = err.to_string();
        error!(attempts, reason = %reason, "Registration failed");
        self.set_status(RegistrationStatus::Failed {
            reason: reason.clone(),
            attempts,
        });
        self.audit.append(
            AuditEventType::RegistrationFailed,
            &json!({
                "serial_number": self.hardware.serial_number,
                "attempts": attempts,
                "reason": reason,
            }),
        )?;
        self.notifications
            .publish(Notification::RegistrationFailed { reason, attempts });
        Ok(err)
    }
}

/// Issues replacement certificates through the registration channel using
/// the device's current credential.
pub struct ChannelIssuer {
    channel: Arc<dyn RegistrationChannel>,
    identity: Arc<IdentityStore>,
}

impl ChannelIssuer {
    pub fn new(channel: Arc<dyn RegistrationChannel>, identity: Arc<IdentityStore>) -> Self {
        Self { channel, identity }
    }
}

#[async_trait]
impl CertificateIssuer for ChannelIssuer {
    async fn issue(&self, request: IssueRequest) -> IdentityResult<Certificate> {
        let identity = self
            .identity
            .device_identity()?
            .ok_or(IdentityError::NotRegistered)?;
        let credential = self
            .identity
            .current_credential()?
            .ok_or(IdentityError::NotRegistered)?;

        let response = self
            .channel
            .renew(RenewalRequest {
                device_id: identity.device_id,
                auth_token: credential.auth_token.clone(),
                cert_type: request.cert_type,
                subject: request.subject,
                public_key: request.public_key,
            })
            .await?;

        match response {
            RenewalResponse::Issued(cert) => Ok(cert),
            RenewalResponse::Refused { code, message } => {
                Err(IdentityError::IssuanceRejected(format!("{}: {}", code, message)))
            }
        }
    }
}
