//! Payment gateway client with idempotent retry.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Attempts beyond the first request.
const MAX_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The gateway never returned 204 within the retry budget.
    #[error("payment gateway errored after {attempts} attempts: {last_error}")]
    Upstream { attempts: u32, last_error: String },
}

#[derive(Serialize)]
struct PostPaymentRequest {
    amount: i64,
}

#[derive(Clone)]
pub struct PaymentGatewayClient {
    http: reqwest::Client,
}

impl PaymentGatewayClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// POST the fare to the gateway. One `Idempotency-Key` is minted per
    /// logical call and reused across every retry, so the gateway charges at
    /// most once however flaky the exchange gets.
    pub async fn post_payment(
        &self,
        gateway_url: &str,
        token: &str,
        amount: i64,
    ) -> Result<(), PaymentError> {
        let idempotency_key = Uuid::now_v7().to_string();
        let body = PostPaymentRequest { amount };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self
                .http
                .post(format!("{gateway_url}/payments"))
                .bearer_auth(token)
                .header("Idempotency-Key", &idempotency_key)
                .json(&body)
                .send()
                .await;

            let last_error = match result {
                Ok(res) if res.status() == reqwest::StatusCode::NO_CONTENT => return Ok(()),
                Ok(res) => format!("unexpected status code: {}", res.status()),
                Err(e) => format!("failed to request payment gateway: {e}"),
            };

            if attempts > MAX_RETRIES {
                tracing::error!(error = %last_error, attempts, "payment gateway request failed");
                return Err(PaymentError::Upstream {
                    attempts,
                    last_error,
                });
            }
        }
    }
}

impl Default for PaymentGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}
