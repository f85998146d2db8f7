pub mod credentials;
pub mod io;
pub mod types;
