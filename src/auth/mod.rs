pub mod credential;
pub mod sas;
