pub mod annotations;
pub mod client;
pub mod error;
pub mod types;
