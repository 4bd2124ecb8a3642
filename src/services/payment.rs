//! Payment processor abstraction
//!
//! The terminal's wire protocol lives behind a bridge; the core only ever
//! requests, polls, or cancels a transaction. Completion notifications
//! arrive asynchronously through the payment listener - `request` returning
//! means "transaction pending", never "paid".

use crate::domain::types::PaymentState;
use crate::infra::config::Config;
use crate::infra::error::PaymentError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Start a payment for a session. Returns the transaction id; the
    /// transaction is PENDING until a notification or poll says otherwise.
    async fn request(
        &self,
        session_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<String, PaymentError>;

    async fn status(&self, transaction_id: &str) -> Result<PaymentState, PaymentError>;

    async fn cancel(&self, transaction_id: &str) -> Result<(), PaymentError>;
}

#[derive(Debug, Deserialize)]
struct RequestResponse {
    transaction: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: String,
}

/// HTTP bridge to the payment terminal.
///
/// POST {url}          {"session","amount","currency","location"} -> {"transaction"}
/// GET  {url}/{tx}     -> {"state"}
/// POST {url}/{tx}/cancel
pub struct HttpPaymentProcessor {
    base_url: String,
    /// Tag telling the bridge whether to route to the exit-lane terminal
    /// or the walk-up pay station
    location: &'static str,
    client: reqwest::Client,
}

/// Bridge requests are short JSON round-trips; anything slower than this is
/// a dead terminal, not a slow one
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

impl HttpPaymentProcessor {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .http1_only()
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.payment_terminal_url().trim_end_matches('/').to_string(),
            location: config.payment_location().as_str(),
            client,
        }
    }

    fn tx_url(&self, transaction_id: &str) -> String {
        format!("{}/{}", self.base_url, transaction_id)
    }
}

#[async_trait]
impl PaymentProcessor for HttpPaymentProcessor {
    async fn request(
        &self,
        session_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<String, PaymentError> {
        let body = serde_json::json!({
            "session": session_id,
            "amount": amount.to_string(),
            "currency": currency,
            "location": self.location,
        });

        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PaymentError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PaymentError::Request(format!("terminal returned {}", response.status())));
        }

        let parsed: RequestResponse =
            response.json().await.map_err(|e| PaymentError::Request(e.to_string()))?;

        info!(
            session_id = %session_id,
            transaction_id = %parsed.transaction,
            amount = %amount,
            "payment_requested"
        );
        Ok(parsed.transaction)
    }

    async fn status(&self, transaction_id: &str) -> Result<PaymentState, PaymentError> {
        let response = self
            .client
            .get(self.tx_url(transaction_id))
            .send()
            .await
            .map_err(|e| PaymentError::Request(e.to_string()))?;

        let parsed: StatusResponse =
            response.json().await.map_err(|e| PaymentError::Request(e.to_string()))?;

        parsed
            .state
            .parse()
            .map_err(|_| PaymentError::Request(format!("unknown state {:?}", parsed.state)))
    }

    async fn cancel(&self, transaction_id: &str) -> Result<(), PaymentError> {
        let url = format!("{}/cancel", self.tx_url(transaction_id));
        let response =
            self.client.post(&url).send().await.map_err(|e| PaymentError::Cancel(e.to_string()))?;

        if !response.status().is_success() {
            error!(
                transaction_id = %transaction_id,
                status = %response.status(),
                "payment_cancel_rejected"
            );
            return Err(PaymentError::Cancel(format!("terminal returned {}", response.status())));
        }
        Ok(())
    }
}
