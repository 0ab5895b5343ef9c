//! `TransferIntent` wire message.
//!
//! The producer (transfer initiator) and the consumer (settlement worker) must
//! agree byte-for-byte on this JSON shape:
//!
//! ```json
//! {
//!   "transaction_id": "0190...",
//!   "amount": 30,
//!   "phone_number_origin_user": "0811",
//!   "target_user": "0190...",
//!   "remarks": "rent",
//!   "created_at": "2024-05-01 10:11:12.123456"
//! }
//! ```

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::{Amount, validate_remarks};
use crate::error::{LedgerError, LedgerResult};
use crate::id::{AccountId, TransactionId};

/// `created_at` layout, microsecond precision, UTC, no offset.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Render a timestamp in the wire layout.
pub fn format_created_at(at: DateTime<Utc>) -> String {
    at.format(CREATED_AT_FORMAT).to_string()
}

/// Parse a timestamp written by [`format_created_at`].
pub fn parse_created_at(raw: &str) -> LedgerResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| LedgerError::malformed(format!("created_at {raw:?}: {e}")))
}

/// Current time truncated to what the wire layout can carry.
pub fn wire_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Authorized-but-unsettled transfer, as published on the bus.
///
/// Fields stay loosely typed (`target_user`, `created_at` as strings) so a
/// bad producer surfaces as a permanent settlement failure rather than a
/// decode error on an otherwise readable message. Use [`TransferIntent::validate`]
/// to obtain the typed view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub transaction_id: TransactionId,
    pub amount: i64,
    #[serde(rename = "phone_number_origin_user")]
    pub sender_handle: String,
    #[serde(rename = "target_user")]
    pub recipient_id: String,
    #[serde(default)]
    pub remarks: String,
    pub created_at: String,
}

/// Typed view of a [`TransferIntent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIntent {
    pub transfer_id: TransactionId,
    pub amount: Amount,
    pub sender_handle: String,
    pub recipient_id: AccountId,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferIntent {
    pub fn new(
        transfer_id: TransactionId,
        amount: Amount,
        sender_handle: impl Into<String>,
        recipient_id: AccountId,
        remarks: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: transfer_id,
            amount: amount.get(),
            sender_handle: sender_handle.into(),
            recipient_id: recipient_id.to_string(),
            remarks: remarks.unwrap_or_default(),
            created_at: format_created_at(created_at),
        }
    }

    /// Bus partition key. One sender's transfers land on one partition.
    pub fn partition_key(&self) -> &str {
        &self.sender_handle
    }

    pub fn encode(&self) -> LedgerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LedgerError::malformed(format!("encode transfer intent: {e}"))
                .with_transfer(self.transaction_id)
        })
    }

    pub fn decode(payload: &[u8]) -> LedgerResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| LedgerError::malformed(format!("decode transfer intent: {e}")))
    }

    /// Check every field; failures are `MalformedMessage` with the transfer id.
    pub fn validate(&self) -> LedgerResult<ValidatedIntent> {
        let id = self.transaction_id;
        let amount = Amount::new(self.amount)
            .map_err(|e| LedgerError::malformed(e.message().to_string()).with_transfer(id))?;
        let recipient_id = self.recipient_id.parse::<AccountId>().map_err(|e| {
            LedgerError::malformed(format!("target_user: {}", e.message())).with_transfer(id)
        })?;
        if self.sender_handle.is_empty() {
            return Err(LedgerError::malformed("missing sender handle").with_transfer(id));
        }
        let created_at = parse_created_at(&self.created_at).map_err(|e| e.with_transfer(id))?;
        let remarks = validate_remarks(Some(self.remarks.clone()))
            .map_err(|e| LedgerError::malformed(e.message().to_string()).with_transfer(id))?;

        Ok(ValidatedIntent {
            transfer_id: id,
            amount,
            sender_handle: self.sender_handle.clone(),
            recipient_id,
            remarks,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn intent() -> TransferIntent {
        TransferIntent::new(
            TransactionId::new(),
            Amount::new(30).unwrap(),
            "0811",
            AccountId::new(),
            Some("rent".into()),
            wire_now(),
        )
    }

    #[test]
    fn created_at_uses_fixed_layout() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 11, 12).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(format_created_at(at), "2024-05-01 10:11:12.123456");
        assert_eq!(parse_created_at("2024-05-01 10:11:12.123456").unwrap(), at);
    }

    #[test]
    fn json_uses_wire_field_names() {
        let i = intent();
        let json: serde_json::Value = serde_json::from_slice(&i.encode().unwrap()).unwrap();
        for field in [
            "transaction_id",
            "amount",
            "phone_number_origin_user",
            "target_user",
            "remarks",
            "created_at",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(TransferIntent::decode(&i.encode().unwrap()).unwrap(), i);
    }

    #[test]
    fn validate_flags_bad_recipient_as_malformed() {
        let mut i = intent();
        i.recipient_id = "nope".into();
        let err = i.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        assert_eq!(err.transfer_id(), Some(i.transaction_id));
    }

    #[test]
    fn validate_flags_bad_timestamp_and_amount() {
        let mut i = intent();
        i.created_at = "2024-05-01T10:11:12Z".into();
        assert_eq!(i.validate().unwrap_err().kind(), ErrorKind::MalformedMessage);

        let mut i = intent();
        i.amount = 0;
        assert_eq!(i.validate().unwrap_err().kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn validate_rejects_overlong_remarks() {
        let mut i = intent();
        i.remarks = "x".repeat(51);
        let err = i.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        assert_eq!(err.transfer_id(), Some(i.transaction_id));

        i.remarks = "x".repeat(50);
        assert_eq!(i.validate().unwrap().remarks.map(|r| r.len()), Some(50));

        i.remarks = "   ".into();
        assert_eq!(i.validate().unwrap().remarks, None);
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = TransferIntent::decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    proptest! {
        #[test]
        fn created_at_round_trips_at_microsecond_precision(
            secs in 0i64..4_102_444_800i64,
            micros in 0u32..1_000_000u32,
        ) {
            let at = DateTime::from_timestamp(secs, micros * 1_000).unwrap();
            prop_assert_eq!(parse_created_at(&format_created_at(at)).unwrap(), at);
        }
    }
}
