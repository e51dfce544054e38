pub mod backend;
pub mod envelope;
pub mod identity;
pub mod request;
