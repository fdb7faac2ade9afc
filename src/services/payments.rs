use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{instrument, warn};
use validator::Validate;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Gateway-issued proof that a payment occurred. Stored verbatim on the
/// order after verification; never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PaymentReference {
    #[validate(length(min = 1, message = "Gateway order id is required"))]
    pub gateway_order_id: String,
    #[validate(length(min = 1, message = "Payment id is required"))]
    pub payment_id: String,
    #[validate(length(min = 1, message = "Payment signature is required"))]
    pub signature: String,
}

/// Validates claimed payments against the gateway's signature scheme.
///
/// Pure predicate: recomputes HMAC-SHA256 over the canonical message
/// `"{gateway_order_id}|{payment_id}"` with the shared secret and compares
/// the hex digest in constant time. A mismatch is `Ok(false)`; only
/// malformed input is an error.
#[derive(Clone)]
pub struct PaymentVerifier {
    secret: String,
}

impl PaymentVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    #[instrument(skip(self, payment), fields(gateway_order_id = %payment.gateway_order_id))]
    pub fn verify(&self, payment: &PaymentReference) -> Result<bool, ServiceError> {
        payment
            .validate()
            .map_err(|e| ServiceError::InvalidInput(e.to_string()))?;

        let message = format!("{}|{}", payment.gateway_order_id, payment.payment_id);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid HMAC key: {}", e)))?;
        mac.update(message.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        let ok = constant_time_eq(&expected, &payment.signature);
        if !ok {
            warn!(payment_id = %payment.payment_id, "Payment signature mismatch");
        }
        Ok(ok)
    }

    /// Computes the expected signature for a payment. Test helper and
    /// reference for gateway integration code.
    pub fn sign(&self, gateway_order_id: &str, payment_id: &str) -> Result<String, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid HMAC key: {}", e)))?;
        mac.update(format!("{}|{}", gateway_order_id, payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
