//! Payment webhook boundary
//!
//! Authenticates payment notifications before anything reaches the ledger.
//! The provider signs `id:<payment_id>;request-id:<request_id>;ts:<ts>;`
//! with HMAC-SHA256 and sends `ts=<ts>,v1=<hex digest>` in the signature
//! header.

use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parsed `ts=...,v1=...` signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Provider timestamp, signed as-is
    pub ts: String,

    /// Hex-encoded HMAC digest
    pub v1: String,
}

impl SignatureHeader {
    /// Parse a raw header value
    pub fn parse(raw: &str) -> Result<Self> {
        let mut ts = None;
        let mut v1 = None;

        for part in raw.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                "ts" => ts = Some(value.trim().to_string()),
                "v1" => v1 = Some(value.trim().to_string()),
                _ => {}
            }
        }

        match (ts, v1) {
            (Some(ts), Some(v1)) if !ts.is_empty() && !v1.is_empty() => Ok(Self { ts, v1 }),
            _ => Err(Error::InvalidSignature(
                "Signature header must carry ts and v1".to_string(),
            )),
        }
    }
}

/// Signed string for one notification
fn manifest(payment_id: &str, request_id: Option<&str>, ts: &str) -> String {
    format!(
        "id:{};request-id:{};ts:{};",
        payment_id,
        request_id.unwrap_or_default(),
        ts
    )
}

/// HMAC verifier holding the shared webhook secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    /// Create verifier. An empty secret is a configuration error.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Config("Webhook secret must not be empty".to_string()));
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Config(format!("Invalid webhook secret: {}", e)))
    }

    /// Hex digest the provider would send for these inputs
    pub fn sign(&self, payment_id: &str, request_id: Option<&str>, ts: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(manifest(payment_id, request_id, ts).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a raw signature header against the notification.
    ///
    /// The digest comparison is constant-time.
    pub fn verify(
        &self,
        signature_header: Option<&str>,
        payment_id: &str,
        request_id: Option<&str>,
    ) -> Result<()> {
        let raw = signature_header
            .ok_or_else(|| Error::InvalidSignature("Missing signature header".to_string()))?;
        let header = SignatureHeader::parse(raw)?;

        let provided = hex::decode(&header.v1)
            .map_err(|_| Error::InvalidSignature("Digest is not valid hex".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(manifest(payment_id, request_id, &header.ts).as_bytes());
        mac.verify_slice(&provided).map_err(|_| {
            tracing::warn!(payment_id, "Webhook signature mismatch");
            Error::InvalidSignature("Digest mismatch".to_string())
        })
    }
}

/// Notification body as delivered by the provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookNotification {
    /// Event topic (`payment`, ...)
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Legacy topic field
    pub topic: Option<String>,

    /// Event payload
    pub data: Option<NotificationData>,

    /// Legacy top-level resource id
    pub id: Option<serde_json::Value>,
}

/// Payload of a notification
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationData {
    /// Resource id; string or number depending on API version
    pub id: Option<serde_json::Value>,
}

impl WebhookNotification {
    /// Parse a JSON body
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("Malformed notification: {}", e)))
    }

    /// Topic, preferring `type` over the legacy `topic`
    pub fn topic(&self) -> Option<&str> {
        self.kind.as_deref().or(self.topic.as_deref())
    }

    /// Whether this notification concerns a payment
    pub fn is_payment(&self) -> bool {
        self.topic() == Some("payment")
    }

    /// Resource id the notification refers to
    pub fn payment_id(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.id.as_ref())
            .or(self.id.as_ref())
            .and_then(value_to_id)
    }
}

fn value_to_id(value: &serde_json::Value) -> Option<String> {
    let id = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

/// Payment status that releases coins
pub const STATUS_APPROVED: &str = "approved";

/// Authenticated payment as fetched from the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    /// Provider payment id, used as the idempotency key
    pub id: String,

    /// Provider status (`approved`, `pending`, `rejected`, ...)
    pub status: String,

    /// Checkout metadata
    #[serde(default)]
    pub metadata: PaymentMetadata,
}

/// Metadata attached at checkout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    /// Account the coins belong to
    #[serde(default, alias = "uid")]
    pub account_id: Option<String>,

    /// Purchased bundle
    #[serde(default, alias = "bundleId", alias = "bundle_id")]
    pub bundle: Option<String>,
}

impl PaymentConfirmation {
    /// Whether the payment cleared
    pub fn is_approved(&self) -> bool {
        self.status == STATUS_APPROVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new("whsec_test").unwrap()
    }

    #[test]
    fn test_parse_header() {
        let header = SignatureHeader::parse(" ts=1704067200 , v1=abcdef").unwrap();
        assert_eq!(header.ts, "1704067200");
        assert_eq!(header.v1, "abcdef");

        assert!(SignatureHeader::parse("ts=1").is_err());
        assert!(SignatureHeader::parse("garbage").is_err());
    }

    #[test]
    fn test_verify_roundtrip() {
        let verifier = verifier();
        let digest = verifier.sign("12345", Some("req-9"), "1704067200").unwrap();
        let header = format!("ts=1704067200,v1={}", digest);

        verifier
            .verify(Some(&header), "12345", Some("req-9"))
            .unwrap();
    }

    #[test]
    fn test_missing_request_id_signs_empty() {
        let verifier = verifier();
        let digest = verifier.sign("12345", None, "1").unwrap();
        let header = format!("ts=1,v1={}", digest);

        assert!(verifier.verify(Some(&header), "12345", Some("")).is_ok());
        assert!(verifier.verify(Some(&header), "12345", Some("req-1")).is_err());
    }

    #[test]
    fn test_tampering_rejected() {
        let verifier = verifier();
        let digest = verifier.sign("12345", Some("req-9"), "1704067200").unwrap();

        // Different payment id
        let header = format!("ts=1704067200,v1={}", digest);
        assert!(matches!(
            verifier.verify(Some(&header), "99999", Some("req-9")),
            Err(Error::InvalidSignature(_))
        ));

        // Replayed digest with a new timestamp
        let header = format!("ts=1704067201,v1={}", digest);
        assert!(verifier.verify(Some(&header), "12345", Some("req-9")).is_err());

        // Other secret
        let other = SignatureVerifier::new("whsec_other").unwrap();
        let header = format!("ts=1704067200,v1={}", digest);
        assert!(other.verify(Some(&header), "12345", Some("req-9")).is_err());

        assert!(verifier.verify(None, "12345", Some("req-9")).is_err());
        assert!(verifier
            .verify(Some("ts=1704067200,v1=not-hex"), "12345", Some("req-9"))
            .is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(SignatureVerifier::new(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_notification_ids() {
        let n = WebhookNotification::from_json(br#"{"type":"payment","data":{"id":123456}}"#)
            .unwrap();
        assert!(n.is_payment());
        assert_eq!(n.payment_id().as_deref(), Some("123456"));

        let legacy =
            WebhookNotification::from_json(br#"{"topic":"payment","id":"789"}"#).unwrap();
        assert!(legacy.is_payment());
        assert_eq!(legacy.payment_id().as_deref(), Some("789"));

        let empty = WebhookNotification::from_json(br#"{"type":"merchant_order"}"#).unwrap();
        assert!(!empty.is_payment());
        assert_eq!(empty.payment_id(), None);

        assert!(WebhookNotification::from_json(b"not json").is_err());
    }

    #[test]
    fn test_payment_metadata_aliases() {
        let payment: PaymentConfirmation = serde_json::from_str(
            r#"{"id":"42","status":"approved","metadata":{"uid":"user-1","bundleId":"popular"}}"#,
        )
        .unwrap();
        assert!(payment.is_approved());
        assert_eq!(payment.metadata.account_id.as_deref(), Some("user-1"));
        assert_eq!(payment.metadata.bundle.as_deref(), Some("popular"));

        let bare: PaymentConfirmation =
            serde_json::from_str(r#"{"id":"43","status":"pending"}"#).unwrap();
        assert!(!bare.is_approved());
        assert_eq!(bare.metadata, PaymentMetadata::default());
    }
}
