pub mod decoder;
pub mod engine;
pub mod resample;
pub mod transport;
pub mod types;
