pub mod error;
pub mod provider;
pub mod remote;
pub mod simulated;

/// Connection credentials handed to a bound application. Opaque to the broker.
pub type Credentials = serde_json::Map<String, serde_json::Value>;
