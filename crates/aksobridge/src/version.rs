//! Version information for aksobridge.

/// Crate version from Cargo.toml
pub const AKSOBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

const PROJECT_URL: &str = "https://github.com/AksoEo/aksobridged";

/// User agent sent with every upstream request.
pub fn user_agent() -> String {
    format!("AKSOBridge/{AKSOBRIDGE_VERSION} (+{PROJECT_URL})")
}
