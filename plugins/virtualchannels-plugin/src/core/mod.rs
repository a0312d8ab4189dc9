pub mod htlc;
pub mod ledger;
pub mod payment;
pub mod provider;
pub mod registry;
pub mod service;
pub mod tlv;
