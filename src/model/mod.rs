//! # Network Graph Model
//!
//! Plain data shared by every layer: addresses, confidences, values and
//! property assertions.
//!
//! Design rule: no locks, no threads, no I/O in this module.

pub mod address;
pub mod confidence;
pub mod network;
pub mod property;
pub mod value;

pub use address::{
    AddressPair, HardwareAddress, HardwareAddressPair, LogicalAddress,
    LogicalAddressMapping, LogicalAddressPair,
};
pub use confidence::Confidence;
pub use network::Network;
pub use property::Property;
pub use value::Value;
