pub mod exponential_backoff;
pub mod safe_converter;
