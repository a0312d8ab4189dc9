pub mod cln_adapters;
pub mod core;
pub mod model;
pub mod proto;
