//! Operator-facing notifications.
//!
//! Components publish onto a [`NotificationBus`]; an external observer
//! (health monitor, operator console) subscribes and decides how to surface
//! them. The core never assumes a particular sink.

use crate::clock::TimestampMs;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    CertificateExpiringSoon {
        cert_id: String,
        cert_type: String,
        not_after_ms: TimestampMs,
    },
    CertificateExpired {
        cert_id: String,
        cert_type: String,
        not_after_ms: TimestampMs,
    },
    CertificateRevoked {
        cert_id: String,
        reason: String,
    },
    ClockOffsetJumped {
        previous_offset_ms: i64,
        new_offset_ms: i64,
    },
    RegistrationFailed {
        reason: String,
        attempts: u32,
    },
    /// Security incident: audit tamper, credential revoked mid-session, peer authentication failure.
    IntegrityAlert {
        component: String,
        detail: String,
    },
    TelemetryBatchAbandoned {
        batch_id: String,
        attempts: u32,
        reason: String,
    },
}

impl Notification {
    /// High-priority notifications need operator attention immediately.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            Notification::IntegrityAlert { .. }
                | Notification::CertificateExpired { .. }
                | Notification::CertificateRevoked { .. }
        )
    }
}

/// Broadcast channel for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Having no subscriber is not an error.
    pub fn publish(&self, notification: Notification) {
        if notification.is_high_priority() {
            warn!(notification = ?notification, "High-priority notification");
        }
        if self.tx.send(notification).is_err() {
            debug!("Notification published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_notifications() {
        let bus = NotificationBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Notification::ClockOffsetJumped {
            previous_offset_ms: 0,
            new_offset_ms: 2_500,
        });

        match rx.recv().await.unwrap() {
            Notification::ClockOffsetJumped { new_offset_ms, .. } => assert_eq!(new_offset_ms, 2_500),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = NotificationBus::new(4);
        bus.publish(Notification::RegistrationFailed {
            reason: "rejected".into(),
            attempts: 1,
        });
    }

    #[test]
    fn test_notifications_serialize_with_kind_tag() {
        let json = serde_json::to_value(Notification::CertificateRevoked {
            cert_id: "c-1".into(),
            reason: "compromised".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "certificate_revoked");
    }
}
