//! Certificate lifecycle management.
//!
//! The manager is the only writer of certificate status. It validates
//! certificates against the trust anchors before they are ever used, tracks
//! expiry against corrected time and rotates certificates through an
//! external issuer without leaving a window in which no certificate of a type
//! is in service.
//!
//! Readers get a lock-free snapshot of the in-service certificates via
//! [`CertificateManager::snapshot`].

use crate::cert_store::CertificateStore;
use crate::error::{IdentityError, IdentityResult};
use crate::pki::{
    Certificate, CertificateMaterial, CertificateStatus, CertificateType, TrustAnchors,
    ValidityReport,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vitalguard_core::config::CertificateConfig;
use vitalguard_core::{
    AuditChain, AuditEventType, ChannelError, CorrectedClock, Notification, NotificationBus,
    RetryError, RetryPolicy,
};
use vitalguard_crypto::DeviceKeyPair;

/// What the device asks an issuer for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub cert_type: CertificateType,
    pub subject: String,
    /// Freshly generated device public key, absent for ServerTrust
    pub public_key: Option<Vec<u8>>,
}

/// Source of replacement certificates.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: IssueRequest) -> IdentityResult<Certificate>;
}

/// In-service certificates by type.
#[derive(Debug, Clone, Default)]
pub struct ActiveCertificates {
    by_type: HashMap<CertificateType, Certificate>,
}

impl ActiveCertificates {
    pub fn get(&self, cert_type: CertificateType) -> Option<&Certificate> {
        self.by_type.get(&cert_type)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.by_type.values()
    }
}

/// The ClientAuth certificate together with its private key.
#[derive(Debug)]
pub struct ClientCredentials {
    pub certificate: Certificate,
    pub key_pair: DeviceKeyPair,
}

pub struct CertificateManager {
    store: Arc<CertificateStore>,
    anchors: TrustAnchors,
    issuer: Arc<dyn CertificateIssuer>,
    clock: Arc<CorrectedClock>,
    audit: Arc<AuditChain>,
    notifications: NotificationBus,
    retry: RetryPolicy,
    rotation_window: Duration,
    network_timeout: Duration,
    active: ArcSwap<ActiveCertificates>,
    rotation: tokio::sync::Mutex<()>,
}

impl CertificateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CertificateStore>,
        anchors: TrustAnchors,
        issuer: Arc<dyn CertificateIssuer>,
        clock: Arc<CorrectedClock>,
        audit: Arc<AuditChain>,
        notifications: NotificationBus,
        retry: RetryPolicy,
        config: &CertificateConfig,
    ) -> IdentityResult<Self> {
        let manager = Self {
            store,
            anchors,
            issuer,
            clock,
            audit,
            notifications,
            retry,
            rotation_window: config.rotation_window(),
            network_timeout: config.network_timeout(),
            active: ArcSwap::from_pointee(ActiveCertificates::default()),
            rotation: tokio::sync::Mutex::new(()),
        };
        manager.refresh_snapshot()?;
        info!(
            in_service = manager.snapshot().len(),
            anchors = manager.anchors.len(),
            "Certificate manager ready"
        );
        Ok(manager)
    }

    fn refresh_snapshot(&self) -> IdentityResult<()> {
        let by_type = self
            .store
            .in_service()?
            .into_iter()
            .map(|cert| (cert.cert_type, cert))
            .collect();
        self.active.store(Arc::new(ActiveCertificates { by_type }));
        Ok(())
    }

    /// Current in-service certificates.
    pub fn snapshot(&self) -> Arc<ActiveCertificates> {
        self.active.load_full()
    }

    pub fn active(&self, cert_type: CertificateType) -> Option<Certificate> {
        self.active.load().get(cert_type).cloned()
    }

    pub fn certificate(&self, cert_id: &str) -> IdentityResult<Certificate> {
        self.store.require(cert_id)
    }

    pub fn certificates(&self) -> IdentityResult<Vec<Certificate>> {
        self.store.list()
    }

    /// Stored status corrected for time: an in-service certificate past its
    /// not-after is reported as Expired even before the next expiry check.
    pub fn credential_status(&self, cert_id: &str) -> IdentityResult<CertificateStatus> {
        let cert = self.store.require(cert_id)?;
        if cert.status.is_in_service() && self.clock.now() >= cert.not_after_ms {
            return Ok(CertificateStatus::Expired);
        }
        Ok(cert.status)
    }

    /// Check signature, validity window and revocation of a stored certificate.
    pub fn validate(&self, cert_id: &str) -> IdentityResult<ValidityReport> {
        let cert = self.store.require(cert_id)?;
        Ok(self.check(&cert))
    }

    fn check(&self, cert: &Certificate) -> ValidityReport {
        let now = self.clock.now();
        let mut problems = Vec::new();

        let signature_valid = match self.anchors.verify(cert) {
            Ok(()) => true,
            Err(reason) => {
                problems.push(reason);
                false
            }
        };

        let within_validity = cert.is_within_validity(now);
        if now < cert.not_before_ms {
            problems.push(format!("not valid before {}", cert.not_before_ms));
        } else if now >= cert.not_after_ms {
            problems.push(format!("expired at {}", cert.not_after_ms));
        }

        let revoked = cert.status == CertificateStatus::Revoked;
        if revoked {
            problems.push("revoked".to_string());
        }

        ValidityReport {
            cert_id: cert.id.clone(),
            signature_valid,
            within_validity,
            revoked,
            problems,
        }
    }

    /// Install a certificate: stored Pending, validated, then promoted to
    /// Active, or straight to ExpiringSoon when it already falls inside the
    /// rotation window. A certificate that fails validation is removed and
    /// never becomes usable.
    ///
    /// Returns the ids of certificates it superseded.
    pub fn install(
        &self,
        cert: Certificate,
        material: CertificateMaterial,
    ) -> IdentityResult<Vec<String>> {
        let mut cert = cert;
        cert.status = CertificateStatus::Pending;
        let now = self.clock.now();
        self.store.insert(&cert, &material, now)?;

        let report = self.check(&cert);
        if !report.is_valid() {
            self.store.delete(&cert.id)?;
            let reason = report.problems.join("; ");
            warn!(cert_id = %cert.id, reason = %reason, "Certificate rejected at install");
            self.audit.append(
                AuditEventType::CertificateValidationFailed,
                &json!({
                    "cert_id": cert.id,
                    "cert_type": cert.cert_type.as_str(),
                    "problems": report.problems,
                }),
            )?;
            return Err(IdentityError::CertificateValidation {
                cert_id: cert.id,
                reason,
            });
        }

        let now = self.clock.now();
        let status = cert.status_at(now, self.rotation_window);
        let superseded = self.store.promote(&cert.id, status, now)?;
        self.refresh_snapshot()?;

        self.audit.append(
            AuditEventType::CertificateInstalled,
            &json!({
                "cert_id": cert.id,
                "cert_type": cert.cert_type.as_str(),
                "subject": cert.subject,
                "issuer": cert.issuer,
                "not_after_ms": cert.not_after_ms,
                "status": status.as_str(),
                "superseded": superseded,
            }),
        )?;
        info!(cert_id = %cert.id, cert_type = %cert.cert_type, status = %status, "Certificate installed");

        if status == CertificateStatus::ExpiringSoon {
            warn!(cert_id = %cert.id, not_after_ms = cert.not_after_ms, "Certificate installed inside rotation window");
            self.audit.append(
                AuditEventType::CertificateExpiringSoon,
                &json!({
                    "cert_id": cert.id,
                    "cert_type": cert.cert_type.as_str(),
                    "not_after_ms": cert.not_after_ms,
                }),
            )?;
            self.notifications.publish(Notification::CertificateExpiringSoon {
                cert_id: cert.id.clone(),
                cert_type: cert.cert_type.to_string(),
                not_after_ms: cert.not_after_ms,
            });
        }
        Ok(superseded)
    }

    /// Reverse an [`install`](Self::install) whose surrounding operation
    /// failed: the new certificate is dropped and the certificates it
    /// superseded go back to the status their validity window gives them.
    pub fn roll_back_install(&self, cert_id: &str, superseded: &[String]) -> IdentityResult<()> {
        let now = self.clock.now();
        let mut restore = Vec::with_capacity(superseded.len());
        for id in superseded {
            let previous = self.store.require(id)?;
            restore.push((id.clone(), previous.status_at(now, self.rotation_window)));
        }
        self.store.roll_back(cert_id, &restore, now)?;
        self.refresh_snapshot()?;
        warn!(cert_id, restored = ?superseded, "Certificate install rolled back");
        Ok(())
    }

    /// Move in-service certificates to ExpiringSoon / Expired as time passes.
    ///
    /// Each transition is audited and notified once. Returns every
    /// certificate that needs rotation: ExpiringSoon ones, plus Expired ones
    /// whose type has nothing else in service.
    pub fn check_expirations(&self) -> IdentityResult<Vec<Certificate>> {
        let now = self.clock.now();
        let mut changed = false;

        for mut cert in self.store.in_service()? {
            let status = cert.status_at(now, self.rotation_window);
            if status == cert.status {
                continue;
            }
            // a certificate never moves back from ExpiringSoon to Active
            if status == CertificateStatus::Active {
                continue;
            }

            self.store.set_status(&cert.id, status, now)?;
            cert.status = status;
            changed = true;

            let payload = json!({
                "cert_id": cert.id,
                "cert_type": cert.cert_type.as_str(),
                "not_after_ms": cert.not_after_ms,
            });
            match status {
                CertificateStatus::ExpiringSoon => {
                    warn!(cert_id = %cert.id, not_after_ms = cert.not_after_ms, "Certificate expiring soon");
                    self.audit.append(AuditEventType::CertificateExpiringSoon, &payload)?;
                    self.notifications.publish(Notification::CertificateExpiringSoon {
                        cert_id: cert.id.clone(),
                        cert_type: cert.cert_type.to_string(),
                        not_after_ms: cert.not_after_ms,
                    });
                }
                CertificateStatus::Expired => {
                    error!(cert_id = %cert.id, not_after_ms = cert.not_after_ms, "Certificate expired");
                    self.audit.append(AuditEventType::CertificateExpired, &payload)?;
                    self.notifications.publish(Notification::CertificateExpired {
                        cert_id: cert.id.clone(),
                        cert_type: cert.cert_type.to_string(),
                        not_after_ms: cert.not_after_ms,
                    });
                }
                _ => {}
            }
        }

        if changed {
            self.refresh_snapshot()?;
        }

        let snapshot = self.snapshot();
        let mut due: Vec<Certificate> = snapshot
            .iter()
            .filter(|c| c.status == CertificateStatus::ExpiringSoon)
            .cloned()
            .collect();
        for cert_type in CertificateType::ALL {
            if snapshot.get(cert_type).is_some() {
                continue;
            }
            if let Some(expired) = self
                .store
                .list_by_type(cert_type)?
                .into_iter()
                .filter(|c| c.status == CertificateStatus::Expired)
                .max_by_key(|c| c.not_after_ms)
            {
                due.push(expired);
            }
        }
        Ok(due)
    }

    /// Obtain, validate and activate a replacement for `cert_type`.
    ///
    /// The previous certificate stays in service until the replacement is
    /// Active. On failure or cancellation it is left untouched.
    pub async fn rotate(
        &self,
        cert_type: CertificateType,
        cancel: &CancellationToken,
    ) -> IdentityResult<Certificate> {
        let _rotation = self.rotation.lock().await;

        let previous = self.latest_of_type(cert_type)?;
        let subject = previous
            .as_ref()
            .map(|c| c.subject.clone())
            .ok_or(IdentityError::NoActiveCertificate { cert_type })?;
        let previous_id = previous.map(|c| c.id);

        let key_pair = cert_type.has_device_key().then(DeviceKeyPair::generate);
        let request = IssueRequest {
            cert_type,
            subject,
            public_key: key_pair.as_ref().map(|k| k.public_key().to_vec()),
        };

        info!(cert_type = %cert_type, previous = ?previous_id, "Rotating certificate");
        let issued = self
            .retry
            .run(cancel, "certificate_rotation", |_| self.issue_once(&request))
            .await;

        let cert = match issued {
            Ok(cert) => cert,
            Err(RetryError::Cancelled { attempts }) => {
                info!(cert_type = %cert_type, attempts, "Certificate rotation cancelled");
                return Err(IdentityError::Cancelled);
            }
            Err(e) => {
                let attempts = e.attempts();
                let err = e.into_inner().unwrap_or(IdentityError::Cancelled);
                self.rotation_failed(cert_type, previous_id.as_deref(), attempts, &err)?;
                return Err(err);
            }
        };

        if let Some(pair) = &key_pair {
            if cert.public_key != pair.public_key() {
                let err = IdentityError::CertificateValidation {
                    cert_id: cert.id.clone(),
                    reason: "issued public key does not match the request".into(),
                };
                self.rotation_failed(cert_type, previous_id.as_deref(), 1, &err)?;
                return Err(err);
            }
        }
        if cert.cert_type != cert_type {
            let err = IdentityError::CertificateValidation {
                cert_id: cert.id.clone(),
                reason: format!("issuer returned {} instead of {}", cert.cert_type, cert_type),
            };
            self.rotation_failed(cert_type, previous_id.as_deref(), 1, &err)?;
            return Err(err);
        }

        if cancel.is_cancelled() {
            return Err(IdentityError::Cancelled);
        }

        let material = match &key_pair {
            Some(pair) => CertificateMaterial::with_private_key(pair),
            None => CertificateMaterial::public_only(),
        };
        let new_id = cert.id.clone();
        if let Err(err) = self.install(cert, material) {
            self.rotation_failed(cert_type, previous_id.as_deref(), 1, &err)?;
            return Err(err);
        }

        self.audit.append(
            AuditEventType::CertificateRotated,
            &json!({
                "cert_type": cert_type.as_str(),
                "previous_cert_id": previous_id,
                "cert_id": new_id,
            }),
        )?;
        info!(cert_type = %cert_type, cert_id = %new_id, "Certificate rotated");
        self.store.require(&new_id)
    }

    async fn issue_once(&self, request: &IssueRequest) -> IdentityResult<Certificate> {
        match tokio::time::timeout(self.network_timeout, self.issuer.issue(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(IdentityError::Channel(ChannelError::Timeout {
                operation: "certificate issuance".into(),
                after_ms: self.network_timeout.as_millis() as u64,
            })),
        }
    }

    /// In-service certificate of `cert_type`, else its latest expired one.
    fn latest_of_type(&self, cert_type: CertificateType) -> IdentityResult<Option<Certificate>> {
        if let Some(cert) = self.active(cert_type) {
            return Ok(Some(cert));
        }
        Ok(self
            .store
            .list_by_type(cert_type)?
            .into_iter()
            .filter(|c| c.status == CertificateStatus::Expired)
            .max_by_key(|c| c.not_after_ms))
    }

    fn rotation_failed(
        &self,
        cert_type: CertificateType,
        previous_id: Option<&str>,
        attempts: u32,
        err: &IdentityError,
    ) -> IdentityResult<()> {
        error!(cert_type = %cert_type, attempts, error = %err, "Certificate rotation failed");
        self.audit.append(
            AuditEventType::CertificateRotationFailed,
            &json!({
                "cert_type": cert_type.as_str(),
                "previous_cert_id": previous_id,
                "attempts": attempts,
                "reason": err.to_string(),
            }),
        )?;
        Ok(())
    }

    /// Revoke a certificate. It stops being usable immediately.
    pub fn revoke(&self, cert_id: &str, reason: &str) -> IdentityResult<()> {
        let cert = self.store.require(cert_id)?;
        if cert.status == CertificateStatus::Revoked {
            return Ok(());
        }
        if cert.status == CertificateStatus::Pending {
            return Err(IdentityError::InvalidTransition {
                cert_id: cert_id.to_string(),
                from: cert.status,
                to: CertificateStatus::Revoked,
            });
        }

        self.store
            .set_status(cert_id, CertificateStatus::Revoked, self.clock.now())?;
        self.refresh_snapshot()?;

        error!(cert_id, reason, "Certificate revoked");
        self.audit.append(
            AuditEventType::CertificateRevoked,
            &json!({
                "cert_id": cert_id,
                "cert_type": cert.cert_type.as_str(),
                "previous_status": cert.status.as_str(),
                "reason": reason,
            }),
        )?;
        self.notifications.publish(Notification::CertificateRevoked {
            cert_id: cert_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// ClientAuth certificate and key for opening a session.
    pub fn client_credentials(&self) -> IdentityResult<ClientCredentials> {
        let certificate = self
            .active(CertificateType::ClientAuth)
            .ok_or(IdentityError::NoActiveCertificate {
                cert_type: CertificateType::ClientAuth,
            })?;
        if self.clock.now() >= certificate.not_after_ms {
            return Err(IdentityError::NoActiveCertificate {
                cert_type: CertificateType::ClientAuth,
            });
        }

        let material = self.store.material(&certificate.id)?;
        let secret = material.private_key.as_deref().ok_or_else(|| {
            IdentityError::CorruptRecord(format!("{} has no private key", certificate.id))
        })?;
        let key_pair = DeviceKeyPair::from_secret_bytes(secret)?;
        if key_pair.public_key()[..] != certificate.public_key[..] {
            return Err(IdentityError::CorruptRecord(format!(
                "{} private key does not match certificate",
                certificate.id
            )));
        }

        Ok(ClientCredentials {
            certificate,
            key_pair,
        })
    }

    /// ServerTrust certificate the server must present.
    pub fn server_trust(&self) -> IdentityResult<Certificate> {
        self.active(CertificateType::ServerTrust)
            .ok_or(IdentityError::NoActiveCertificate {
                cert_type: CertificateType::ServerTrust,
            })
    }

    /// Periodic expiry check; triggers rotation for everything due.
    pub async fn run(&self, check_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let due = match self.check_expirations() {
                Ok(due) => due,
                Err(e) => {
                    error!(error = %e, "Certificate expiry check failed");
                    continue;
                }
            };
            for cert in due {
                if let Err(e) = self.rotate(cert.cert_type, &cancel).await {
                    warn!(cert_type = %cert.cert_type, error = %e, "Scheduled rotation did not complete");
                }
            }
        }
        info!("Certificate manager stopped");
    }
}
