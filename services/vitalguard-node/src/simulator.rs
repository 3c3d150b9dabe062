//! In-process stand-in for the central server, used with `--simulate`.
//!
//! Plays registration authority, time server and telemetry sink. Its CA and
//! server keys are derived from fixed labels so certificates issued in an
//! earlier run stay verifiable after a restart.

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use vitalguard_core::config::TrustAnchorConfig;
use vitalguard_core::{
    ChannelError, ClockSyncChannel, ClockSyncReply, ClockSyncRequest, LocalClock, SystemClock,
};
use vitalguard_crypto::{digest, verify_signature, DeviceKeyPair, SigningError};
use vitalguard_identity::{
    Certificate, CertificateAuthority, CertificateType, RefusalCode, RegistrationChannel,
    RegistrationGrant, RegistrationRequest, RegistrationResponse, RenewalRequest, RenewalResponse,
};
use vitalguard_telemetry::{
    BatchResponse, ClientHello, Rejection, SignedBatch, TelemetryChannel, TelemetrySession,
};

const ISSUER: &str = "vitalguard-sim-ca";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const TOKEN_VALIDITY_MS: i64 = 30 * DAY_MS;

pub struct SimulatedCentral {
    ca: Mutex<CertificateAuthority>,
    ca_public_key: Vec<u8>,
    server_key: DeviceKeyPair,
    server_cert: Certificate,
    clock: SystemClock,
    skew_ms: i64,
    cert_validity_ms: i64,
    /// Tokens issued by this process. Devices registered in an earlier run
    /// are trusted on renewal.
    tokens: Mutex<HashMap<String, String>>,
    delivered: Arc<Mutex<HashSet<String>>>,
}

impl SimulatedCentral {
    pub fn new(skew_ms: i64, cert_validity_days: i64) -> Result<Self, SigningError> {
        let clock = SystemClock;
        let now = clock.now_ms();
        let cert_validity_ms = cert_validity_days * DAY_MS;

        let ca_key = DeviceKeyPair::from_secret_bytes(&digest(b"vitalguard-simulator-ca"))?;
        let ca_public_key = ca_key.public_key().to_vec();
        let server_key = DeviceKeyPair::from_secret_bytes(&digest(b"vitalguard-simulator-server"))?;

        let mut ca = CertificateAuthority::with_key(ISSUER, ca_key, now.max(1) as u64);
        let server_cert = ca.issue(
            CertificateType::ServerTrust,
            "central.simulated",
            server_key.public_key().to_vec(),
            now - DAY_MS,
            now + cert_validity_ms,
        );
        info!(issuer = ISSUER, skew_ms, "Simulated central server ready");

        Ok(Self {
            ca: Mutex::new(ca),
            ca_public_key,
            server_key,
            server_cert,
            clock,
            skew_ms,
            cert_validity_ms,
            tokens: Mutex::new(HashMap::new()),
            delivered: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn anchor_config(&self) -> TrustAnchorConfig {
        TrustAnchorConfig {
            issuer: ISSUER.to_string(),
            public_key_hex: hex::encode(&self.ca_public_key),
        }
    }

    /// Distinct batches received so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }

    fn server_now(&self) -> i64 {
        self.clock.now_ms() + self.skew_ms
    }

    fn issue(
        &self,
        cert_type: CertificateType,
        subject: &str,
        public_key: Vec<u8>,
    ) -> Result<Certificate, ChannelError> {
        let now = self.server_now();
        let mut ca = self
            .ca
            .lock()
            .map_err(|_| ChannelError::Unavailable("simulator state poisoned".into()))?;
        Ok(ca.issue(cert_type, subject, public_key, now - 60_000, now + self.cert_validity_ms))
    }
}

fn refused_metadata(message: impl Into<String>) -> RegistrationResponse {
    RegistrationResponse::Refused {
        code: RefusalCode::InvalidMetadata,
        message: message.into(),
    }
}

#[async_trait]
impl RegistrationChannel for SimulatedCentral {
    async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse, ChannelError> {
        if let Err(e) = request.hardware.validate() {
            return Ok(refused_metadata(e.to_string()));
        }
        if request.public_key.len() != 32 {
            return Ok(refused_metadata("public key must be 32 bytes"));
        }

        let device_id = format!("vg-{}", request.hardware.serial_number.to_lowercase());
        let auth_token = format!("{:032x}", rand::thread_rng().gen::<u128>());
        {
            let mut tokens = self
                .tokens
                .lock()
                .map_err(|_| ChannelError::Unavailable("simulator state poisoned".into()))?;
            if tokens.contains_key(&device_id) && request.previous_device_id.is_none() {
                return Ok(RegistrationResponse::Refused {
                    code: RefusalCode::AlreadyRegistered,
                    message: format!("{} is already registered", device_id),
                });
            }
            tokens.insert(device_id.clone(), auth_token.clone());
        }

        let client_certificate =
            self.issue(CertificateType::ClientAuth, &device_id, request.public_key)?;
        info!(device_id = %device_id, cert_id = %client_certificate.id, "Simulator registered device");

        Ok(RegistrationResponse::Granted(RegistrationGrant {
            device_id,
            auth_token,
            token_expires_at_ms: self.server_now() + TOKEN_VALIDITY_MS,
            client_certificate,
            server_trust: Some(self.server_cert.clone()),
        }))
    }

    async fn renew(&self, request: RenewalRequest) -> Result<RenewalResponse, ChannelError> {
        let known = self
            .tokens
            .lock()
            .map_err(|_| ChannelError::Unavailable("simulator state poisoned".into()))?
            .get(&request.device_id)
            .cloned();
        if matches!(known, Some(token) if token != request.auth_token) {
            return Ok(RenewalResponse::Refused {
                code: RefusalCode::Rejected,
                message: "auth token mismatch".into(),
            });
        }

        let public_key = match (request.cert_type, request.public_key) {
            (CertificateType::ServerTrust, _) => self.server_key.public_key().to_vec(),
            (_, Some(key)) => key,
            (_, None) => {
                return Ok(RenewalResponse::Refused {
                    code: RefusalCode::InvalidMetadata,
                    message: "public key required".into(),
                })
            }
        };
        let cert = self.issue(request.cert_type, &request.subject, public_key)?;
        info!(device_id = %request.device_id, cert_id = %cert.id, "Simulator renewed certificate");
        Ok(RenewalResponse::Issued(cert))
    }
}

#[async_trait]
impl ClockSyncChannel for SimulatedCentral {
    async fn exchange(&self, _request: ClockSyncRequest) -> Result<ClockSyncReply, ChannelError> {
        Ok(ClockSyncReply {
            server_time_ms: self.server_now(),
        })
    }
}

#[async_trait]
impl TelemetryChannel for SimulatedCentral {
    async fn connect(&self, hello: ClientHello) -> Result<Box<dyn TelemetrySession>, ChannelError> {
        hello
            .verify_possession()
            .map_err(|e| ChannelError::Protocol(format!("client hello rejected: {}", e)))?;
        verify_signature(
            &self.ca_public_key,
            &hello.certificate.canonical_bytes(),
            &hello.certificate.signature,
        )
        .map_err(|_| ChannelError::Protocol("client certificate not issued by this server".into()))?;

        debug!(cert_id = %hello.certificate.id, "Simulator accepted telemetry session");
        Ok(Box::new(SimulatedSession {
            peer: self.server_cert.clone(),
            client_key: hello.certificate.public_key,
            delivered: self.delivered.clone(),
            responses: VecDeque::new(),
        }))
    }
}

struct SimulatedSession {
    peer: Certificate,
    client_key: Vec<u8>,
    delivered: Arc<Mutex<HashSet<String>>>,
    responses: VecDeque<BatchResponse>,
}

#[async_trait]
impl TelemetrySession for SimulatedSession {
    fn peer_certificate(&self) -> &Certificate {
        &self.peer
    }

    async fn send(&mut self, batch: &SignedBatch) -> Result<(), ChannelError> {
        let batch_id = batch.batch.batch_id.clone();
        if let Err(e) = batch.verify(&self.client_key) {
            warn!(batch_id = %batch_id, error = %e, "Simulator rejecting batch");
            self.responses.push_back(BatchResponse::Rejected {
                batch_id,
                reason: Rejection::Malformed,
                detail: e.to_string(),
            });
            return Ok(());
        }

        let fresh = self
            .delivered
            .lock()
            .map_err(|_| ChannelError::Unavailable("simulator state poisoned".into()))?
            .insert(batch_id.clone());
        if !fresh {
            debug!(batch_id = %batch_id, "Simulator deduplicated redelivered batch");
        }
        self.responses.push_back(BatchResponse::Ack { batch_id });
        Ok(())
    }

    async fn next_response(&mut self) -> Result<BatchResponse, ChannelError> {
        match self.responses.pop_front() {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.responses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitalguard_identity::HardwareInfo;
    use vitalguard_telemetry::{Reading, TelemetryBatch};

    fn hardware() -> HardwareInfo {
        HardwareInfo {
            serial_number: "SN-7".into(),
            model: "VG-BEDSIDE-1".into(),
            firmware_version: "1.0.0".into(),
        }
    }

    #[tokio::test]
    async fn test_registers_and_acks_signed_batches() {
        let central = SimulatedCentral::new(0, 365).unwrap();
        let device_key = DeviceKeyPair::generate();

        let grant = match central
            .register(RegistrationRequest {
                hardware: hardware(),
                public_key: device_key.public_key().to_vec(),
                previous_device_id: None,
            })
            .await
            .unwrap()
        {
            RegistrationResponse::Granted(grant) => grant,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(grant.device_id, "vg-sn-7");

        let creds = vitalguard_identity::ClientCredentials {
            certificate: grant.client_certificate,
            key_pair: device_key,
        };
        let mut session = central
            .connect(ClientHello::new(&creds, central.server_now()))
            .await
            .unwrap();

        let batch = TelemetryBatch::new(
            "vg-sn-7",
            vec![Reading::new("spo2", 1, serde_json::json!(98))],
            1,
        )
        .unwrap();
        let signed = SignedBatch::sign(batch.clone(), &creds, 2).unwrap();
        session.send(&signed).await.unwrap();
        assert_eq!(
            session.next_response().await.unwrap(),
            BatchResponse::Ack {
                batch_id: batch.batch_id
            }
        );
        assert_eq!(central.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_second_registration_is_refused() {
        let central = SimulatedCentral::new(0, 365).unwrap();
        let request = RegistrationRequest {
            hardware: hardware(),
            public_key: DeviceKeyPair::generate().public_key().to_vec(),
            previous_device_id: None,
        };
        central.register(request.clone()).await.unwrap();
        assert!(matches!(
            central.register(request).await.unwrap(),
            RegistrationResponse::Refused {
                code: RefusalCode::AlreadyRegistered,
                ..
            }
        ));
    }

    #[test]
    fn test_keys_are_stable_across_instances() {
        let a = SimulatedCentral::new(0, 365).unwrap();
        let b = SimulatedCentral::new(0, 365).unwrap();
        assert_eq!(a.anchor_config(), b.anchor_config());
        assert_eq!(a.server_cert.public_key, b.server_cert.public_key);
    }
}
