use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{self, Address, DigitalSignature, Wallet};

/// Decimal places every amount is normalized to
const AMOUNT_SCALE: f64 = 100_000_000.0;

/// Reasons a transaction fails validation
#[derive(Debug, Error, PartialEq)]
pub enum TransactionError {
    #[error("Transaction not signed")]
    NotSigned,

    #[error("Transaction id {stored} does not match its contents ({derived})")]
    IdMismatch { stored: String, derived: String },

    #[error("Signature does not verify against sender")]
    InvalidSignature,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Represents a signed value transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Digest of sender, recipient, amount and timestamp
    pub id: String,

    /// Sender's address, or `SYSTEM` for mining rewards
    pub sender: Address,

    /// Recipient's address
    pub recipient: Address,

    /// Amount being transferred
    pub amount: f64,

    /// Sender's signature over `id`
    pub signature: Option<DigitalSignature>,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00.000Z")]
    pub timestamp: DateTime<Utc>,
}

/// Rounds an amount to the fixed ledger precision
pub fn normalize_amount(amount: f64) -> f64 {
    (amount * AMOUNT_SCALE).round() / AMOUNT_SCALE
}

/// Renders an amount the way it enters digests
pub fn format_amount(amount: f64) -> String {
    format!("{:.8}", amount)
}

/// Renders a timestamp the way it enters digests
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current instant at ledger precision
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn derive_id(sender: &Address, recipient: &Address, amount: f64, timestamp: &DateTime<Utc>) -> String {
    let preimage = format!(
        "{}{}{}{}",
        sender,
        recipient,
        format_amount(amount),
        format_timestamp(timestamp)
    );
    crypto::digest(preimage.as_bytes())
}

impl Transaction {
    /// Creates a new unsigned transaction stamped with the current time
    pub fn new(sender: Address, recipient: Address, amount: f64) -> Self {
        Self::with_timestamp(sender, recipient, amount, now())
    }

    /// Creates a new unsigned transaction with a caller-chosen creation time.
    ///
    /// Lets a client derive (and sign) the id before submitting it.
    pub fn with_timestamp(
        sender: Address,
        recipient: Address,
        amount: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let amount = normalize_amount(amount);
        let timestamp = timestamp.trunc_subsecs(3);
        let id = derive_id(&sender, &recipient, amount, &timestamp);

        Transaction {
            id,
            sender,
            recipient,
            amount,
            signature: None,
            timestamp,
        }
    }

    /// Creates the `SYSTEM -> miner` reward transaction
    pub fn reward(miner: Address, amount: f64) -> Self {
        Self::new(Address::system(), miner, amount)
    }

    /// Rebuilds a transaction from persisted fields, trusting every one of
    /// them (including `id`) verbatim.
    pub fn restore(
        id: String,
        sender: Address,
        recipient: Address,
        amount: f64,
        signature: Option<DigitalSignature>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Transaction {
            id,
            sender,
            recipient,
            amount,
            signature,
            timestamp,
        }
    }

    /// Recomputes the id from the current field values
    pub fn compute_id(&self) -> String {
        derive_id(&self.sender, &self.recipient, self.amount, &self.timestamp)
    }

    /// Signs the transaction id.
    ///
    /// The wallet is not checked against `sender`; `is_valid` catches that.
    pub fn sign(&mut self, wallet: &Wallet) {
        self.signature = Some(wallet.sign(self.id.as_bytes()));
    }

    /// Attaches a signature produced elsewhere
    pub fn attach_signature(&mut self, signature: DigitalSignature) {
        self.signature = Some(signature);
    }

    pub fn is_reward(&self) -> bool {
        self.sender.is_system()
    }

    /// Checks authenticity, reporting why a transaction is rejected
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.is_reward() {
            return Ok(());
        }

        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;

        let derived = self.compute_id();
        if derived != self.id {
            return Err(TransactionError::IdMismatch {
                stored: self.id.clone(),
                derived,
            });
        }

        if !crypto::verify(&self.sender, self.id.as_bytes(), signature) {
            return Err(TransactionError::InvalidSignature);
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Shape checks applied to submitted transactions on top of [`Transaction::verify`]
    pub fn check_shape(&self) -> Result<(), TransactionError> {
        if !self.amount.is_finite() {
            return Err(TransactionError::InvalidAmount(format!(
                "Amount must be finite: {}",
                self.amount
            )));
        }

        if self.amount < 0.0 {
            return Err(TransactionError::InvalidAmount(format!(
                "Amount must not be negative: {}",
                self.amount
            )));
        }

        Ok(())
    }

    /// Canonical form used in block hashing.
    ///
    /// Keys are listed sorted so the output is the same whether or not
    /// serde_json preserves insertion order.
    pub(crate) fn canonical_json(&self) -> serde_json::Value {
        serde_json::json!({
            "amount": format_amount(self.amount),
            "id": self.id,
            "recipient": self.recipient.as_str(),
            "sender": self.sender.as_str(),
            "signature": self.signature.as_ref().map(DigitalSignature::as_str),
            "timestamp": format_timestamp(&self.timestamp),
        })
    }
}
