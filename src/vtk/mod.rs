//! VTK (payment terminal) module.
//!
//! Provides a trait-based driver for charging cards and cash through a VTK
//! terminal attached over TCP: a transport over the raw link, a pluggable
//! wire codec (Vendotek), the per-request protocol session and the card
//! reader that callers talk to.

pub mod card_reader;
pub mod mock;
pub mod protocol;
pub mod protocols;
pub mod session;
pub mod transport;

pub use card_reader::CardReader;
