//! Pairing module
//!
//! A requester multicasts its device type on `pairing/0`; a coordinator with
//! an open window and a matching filter answers with its address.

mod coordinator;
mod requester;

pub use self::coordinator::PairingCoordinator;
pub use self::requester::PairingRequester;
