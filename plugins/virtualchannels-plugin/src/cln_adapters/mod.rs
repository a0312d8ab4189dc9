pub mod hooks;
pub mod options;
pub mod rpc;
