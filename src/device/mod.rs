pub mod btle;
pub mod constants;
pub mod correlator;
pub mod fake;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod types;
