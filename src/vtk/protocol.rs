//! VTK protocol trait and shared types.
//!
//! Defines the `Codec` trait that wire-format adapters implement, along with
//! the request, message and outcome types that flow between the card reader
//! driver, the protocol session and the codec.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{CodecError, DriverError, TransportError, ValidationError};

// ---------------------------------------------------------------------------
// Currencies
// ---------------------------------------------------------------------------

/// ISO 4217 numeric code, alphabetic code, minor-unit digits.
const CURRENCIES: &[(u16, &str, u8)] = &[
    (36, "AUD", 2),
    (48, "BHD", 3),
    (124, "CAD", 2),
    (156, "CNY", 2),
    (203, "CZK", 2),
    (208, "DKK", 2),
    (348, "HUF", 2),
    (352, "ISK", 0),
    (392, "JPY", 0),
    (398, "KZT", 2),
    (410, "KRW", 0),
    (414, "KWD", 3),
    (578, "NOK", 2),
    (643, "RUB", 2),
    (752, "SEK", 2),
    (756, "CHF", 2),
    (826, "GBP", 2),
    (840, "USD", 2),
    (933, "BYN", 2),
    (941, "RSD", 2),
    (946, "RON", 2),
    (949, "TRY", 2),
    (975, "BGN", 2),
    (978, "EUR", 2),
    (980, "UAH", 2),
    (985, "PLN", 2),
];

/// A currency the driver knows the minor-unit scale of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Currency {
    code: u16,
    alpha: &'static str,
    minor_digits: u8,
}

impl Currency {
    /// Look up a currency by its ISO 4217 numeric code.
    pub fn from_numeric(code: u16) -> Result<Self, ValidationError> {
        CURRENCIES
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|&(code, alpha, minor_digits)| Self {
                code,
                alpha,
                minor_digits,
            })
            .ok_or(ValidationError::UnknownCurrency(code))
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn alpha(&self) -> &'static str {
        self.alpha
    }

    pub fn minor_digits(&self) -> u8 {
        self.minor_digits
    }

    /// Number of minor units in one main unit (100 for cents, 1 for yen).
    pub fn minor_scale(&self) -> u64 {
        10u64.pow(u32::from(self.minor_digits))
    }

    /// Split an amount in minor units into (main, decimal).
    pub fn split_minor(&self, minor: u64) -> (u64, u64) {
        let scale = self.minor_scale();
        (minor / scale, minor % scale)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.alpha, self.code)
    }
}

// ---------------------------------------------------------------------------
// Money request
// ---------------------------------------------------------------------------

/// Optional product metadata shown on the terminal during a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: u64,
    pub name: String,
}

/// Deadline `timeout` from now. Timeouts past what the clock can represent
/// are rejected rather than silently capped.
pub fn deadline_after(timeout: Duration) -> Result<Instant, ValidationError> {
    Instant::now()
        .checked_add(timeout)
        .ok_or(ValidationError::TimeoutOutOfRange(timeout))
}

/// A validated charge request.
#[derive(Debug, Clone)]
pub struct MoneyRequest {
    currency: Currency,
    main_amount: u64,
    decimal_amount: u64,
    amount_minor: u64,
    operation: u32,
    deadline: Instant,
    product: Option<Product>,
}

impl MoneyRequest {
    /// Validate the amount against the currency's minor-unit rules.
    pub fn new(
        currency_code: u16,
        main_amount: u64,
        decimal_amount: u64,
        operation: u32,
        deadline: Instant,
    ) -> Result<Self, ValidationError> {
        let currency = Currency::from_numeric(currency_code)?;
        let scale = currency.minor_scale();
        if decimal_amount >= scale {
            return Err(ValidationError::DecimalOutOfRange {
                currency: currency_code,
                decimal: decimal_amount,
                max: scale - 1,
            });
        }
        let amount_minor = main_amount
            .checked_mul(scale)
            .and_then(|v| v.checked_add(decimal_amount))
            .ok_or(ValidationError::AmountOverflow)?;
        if amount_minor == 0 {
            return Err(ValidationError::ZeroAmount);
        }

        Ok(Self {
            currency,
            main_amount,
            decimal_amount,
            amount_minor,
            operation,
            deadline,
            product: None,
        })
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.product = Some(product);
        self
    }

    /// Same charge under the operation number the terminal expects.
    pub fn with_operation(mut self, operation: u32) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn main_amount(&self) -> u64 {
        self.main_amount
    }

    pub fn decimal_amount(&self) -> u64 {
        self.decimal_amount
    }

    /// Total amount in minor currency units.
    pub fn amount_minor(&self) -> u64 {
        self.amount_minor
    }

    pub fn operation(&self) -> u32 {
        self.operation
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn product(&self) -> Option<&Product> {
        self.product.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Parameter ids used in terminal messages.
pub mod param {
    pub const NAME: u16 = 0x01;
    pub const OPERATION: u16 = 0x03;
    pub const AMOUNT: u16 = 0x04;
    pub const KEEPALIVE: u16 = 0x05;
    pub const OPERATION_TIMEOUT: u16 = 0x06;
    pub const EVENT_NAME: u16 = 0x07;
    pub const EVENT_NUMBER: u16 = 0x08;
    pub const PRODUCT_ID: u16 = 0x09;
    pub const QR_DATA: u16 = 0x0A;
    pub const PRODUCT_NAME: u16 = 0x0F;
    pub const BANKING_RECEIPT: u16 = 0x13;
    pub const DISPLAY_TIME: u16 = 0x14;

    /// Human-readable label for a parameter id.
    pub fn describe(id: u16) -> &'static str {
        match id {
            NAME => "message name",
            OPERATION => "operation number",
            AMOUNT => "minor currency units",
            KEEPALIVE => "keepalive interval, sec",
            OPERATION_TIMEOUT => "operation timeout, sec",
            EVENT_NAME => "event name",
            EVENT_NUMBER => "event number",
            PRODUCT_ID => "product id",
            QR_DATA => "QR-code data",
            PRODUCT_NAME => "product name",
            BANKING_RECEIPT => "banking receipt",
            DISPLAY_TIME => "display time, ms",
            _ => "unknown parameter",
        }
    }
}

/// Message names.
pub const MSG_IDLE: &str = "IDL";
pub const MSG_VEND: &str = "VRP";
pub const MSG_FINISH: &str = "FIN";

/// One id/value pair of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub id: u16,
    pub value: Vec<u8>,
}

/// An ordered list of parameters, as carried by one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    params: Vec<Param>,
}

impl Message {
    /// Start a message with its name parameter.
    pub fn named(name: &str) -> Self {
        Self::default().with_text(param::NAME, name)
    }

    pub fn with_text(mut self, id: u16, value: &str) -> Self {
        self.push(id, value.as_bytes().to_vec());
        self
    }

    pub fn with_number(self, id: u16, value: u64) -> Self {
        self.with_text(id, &value.to_string())
    }

    pub fn push(&mut self, id: u16, value: Vec<u8>) {
        self.params.push(Param { id, value });
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// First value carried under `id`.
    pub fn get(&self, id: u16) -> Option<&[u8]> {
        self.params
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.value.as_slice())
    }

    pub fn text(&self, id: u16) -> Option<String> {
        self.get(id)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
    }

    pub fn number(&self, id: u16) -> Option<u64> {
        self.text(id).and_then(|s| s.parse().ok())
    }

    pub fn name(&self) -> Option<String> {
        self.text(param::NAME)
    }

    /// One line per parameter, labelled with what the id means. Used for
    /// verbose frame logs.
    pub fn dump(&self) -> String {
        self.params
            .iter()
            .map(|p| {
                format!(
                    "0x{:02X} ({}) = {:?}",
                    p.id,
                    param::describe(p.id),
                    String::from_utf8_lossy(&p.value)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Codec contract
// ---------------------------------------------------------------------------

/// Result of trying to decode a frame from accumulated bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Keep reading.
    Incomplete,
    /// A complete frame; `consumed` bytes belong to it.
    Frame { message: Message, consumed: usize },
    /// The prefix can never become a valid frame.
    Invalid { reason: String },
}

/// Wire-format adapter. Implementations are pure: no I/O, no state.
pub trait Codec: Send + Sync {
    /// Protocol name (for logging/display).
    fn name(&self) -> &str;

    /// Encode a charge command.
    fn encode_request(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError>;

    /// Encode the idle command that opens a charge and announces it.
    fn encode_announce(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError>;

    /// Encode the confirmation that closes an approved charge.
    fn encode_finish(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError>;

    /// Encode an idle/keepalive command.
    fn encode_ping(&self) -> Result<Vec<u8>, CodecError>;

    /// Try to decode one response frame from the start of `buf`.
    fn try_decode_response(&self, buf: &[u8]) -> Decoded;
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal result of one session. Produced exactly once per request.
#[derive(Debug)]
pub enum ResponseOutcome {
    Approved,
    Declined { reason: String },
    DeviceError { code: String },
    Malformed { raw: Vec<u8> },
    TimedOut,
    TransportFailure { cause: TransportError },
}

impl ResponseOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ResponseOutcome::Approved)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ResponseOutcome::Approved => "approved",
            ResponseOutcome::Declined { .. } => "declined",
            ResponseOutcome::DeviceError { .. } => "device_error",
            ResponseOutcome::Malformed { .. } => "malformed",
            ResponseOutcome::TimedOut => "timed_out",
            ResponseOutcome::TransportFailure { .. } => "transport_failure",
        }
    }

    /// Whether the link may hold residual bytes after this outcome.
    pub fn leaves_link_dirty(&self) -> bool {
        matches!(
            self,
            ResponseOutcome::Malformed { .. }
                | ResponseOutcome::TimedOut
                | ResponseOutcome::TransportFailure { .. }
        )
    }

    /// `Approved` is success; every other variant is a descriptive failure.
    pub fn into_result(self) -> Result<(), DriverError> {
        match self {
            ResponseOutcome::Approved => Ok(()),
            ResponseOutcome::Declined { reason } => Err(DriverError::Declined { reason }),
            ResponseOutcome::DeviceError { code } => Err(DriverError::DeviceError { code }),
            ResponseOutcome::Malformed { raw } => Err(DriverError::Malformed { raw }),
            ResponseOutcome::TimedOut => Err(DriverError::TimedOut),
            ResponseOutcome::TransportFailure { cause } => Err(DriverError::Transport(cause)),
        }
    }
}

/// Proof of an approved charge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeReceipt {
    pub operation: u32,
    pub currency: u16,
    pub amount_minor: u64,
    pub started_at: String,
    pub completed_at: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_lookup() {
        let usd = Currency::from_numeric(840).unwrap();
        assert_eq!(usd.alpha(), "USD");
        assert_eq!(usd.minor_scale(), 100);
        assert_eq!(Currency::from_numeric(392).unwrap().minor_scale(), 1);
        assert_eq!(Currency::from_numeric(414).unwrap().minor_scale(), 1000);
        assert_eq!(
            Currency::from_numeric(1),
            Err(ValidationError::UnknownCurrency(1))
        );
    }

    #[test]
    fn test_split_minor() {
        let rub = Currency::from_numeric(643).unwrap();
        assert_eq!(rub.split_minor(1050), (10, 50));
        let jpy = Currency::from_numeric(392).unwrap();
        assert_eq!(jpy.split_minor(500), (500, 0));
    }

    #[test]
    fn test_money_request_amount() {
        let req = MoneyRequest::new(840, 10, 50, 1, Instant::now()).unwrap();
        assert_eq!(req.amount_minor(), 1050);
        assert_eq!(req.currency().code(), 840);
    }

    #[test]
    fn test_money_request_decimal_bounds() {
        assert!(MoneyRequest::new(840, 1, 99, 1, Instant::now()).is_ok());
        assert_eq!(
            MoneyRequest::new(840, 1, 100, 1, Instant::now()).unwrap_err(),
            ValidationError::DecimalOutOfRange {
                currency: 840,
                decimal: 100,
                max: 99
            }
        );
        // Zero-decimal currencies accept no minor part at all
        assert!(MoneyRequest::new(392, 100, 1, 1, Instant::now()).is_err());
    }

    #[test]
    fn test_money_request_rejects_zero_and_overflow() {
        assert_eq!(
            MoneyRequest::new(978, 0, 0, 1, Instant::now()).unwrap_err(),
            ValidationError::ZeroAmount
        );
        assert_eq!(
            MoneyRequest::new(978, u64::MAX, 0, 1, Instant::now()).unwrap_err(),
            ValidationError::AmountOverflow
        );
    }

    #[test]
    fn test_message_accessors() {
        let msg = Message::named(MSG_VEND)
            .with_number(param::OPERATION, 7)
            .with_text(param::EVENT_NAME, " insufficient funds ");
        assert_eq!(msg.name().as_deref(), Some("VRP"));
        assert_eq!(msg.number(param::OPERATION), Some(7));
        assert_eq!(msg.text(param::EVENT_NAME).as_deref(), Some("insufficient funds"));
        assert_eq!(msg.number(param::AMOUNT), None);
    }

    #[test]
    fn test_message_dump_labels_params() {
        let msg = Message::named(MSG_IDLE)
            .with_number(param::OPERATION, 12)
            .with_number(0x7F, 1);
        let dump = msg.dump();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "0x01 (message name) = \"IDL\"");
        assert_eq!(lines[1], "0x03 (operation number) = \"12\"");
        assert!(lines[2].contains("unknown parameter"));
    }

    #[test]
    fn test_deadline_after_rejects_unrepresentable_timeout() {
        assert!(deadline_after(Duration::from_secs(5)).is_ok());
        assert_eq!(
            deadline_after(Duration::MAX),
            Err(ValidationError::TimeoutOutOfRange(Duration::MAX))
        );
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(ResponseOutcome::Approved.into_result().is_ok());
        match (ResponseOutcome::Declined {
            reason: "insufficient funds".into(),
        })
        .into_result()
        {
            Err(DriverError::Declined { reason }) => assert_eq!(reason, "insufficient funds"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ResponseOutcome::TimedOut.into_result(),
            Err(DriverError::TimedOut)
        ));
    }
}
