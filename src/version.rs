// Build-time version from Cargo.toml

/// Package version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name (from Cargo.toml).
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// User-Agent sent with every collector request, e.g. `errorvault-agent/0.8.0`.
pub fn user_agent() -> String {
    format!("{}/{}", NAME, VERSION)
}
