//! Embedded templates for `sandbox-runtime init`.

/// Default `sandbox.toml` configuration.
pub(crate) const SANDBOX_TOML: &str = include_str!("sandbox.toml");

/// Keeps runtime state out of version control.
pub(crate) const STATE_GITIGNORE: &str = "*\n";
