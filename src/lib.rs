pub mod asn1;
pub mod cms;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pki;
pub mod telemetry;
pub mod transport;
pub mod xmldsig;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};
