//! Resolves the identifier the executor stamps onto each task as `client_host`.

/// Best-effort local hostname, resolved once at coordinator construction and
/// passed down as plain configuration (SPEC_FULL.md §9, "cached-once computed
/// properties").
///
/// Falls back to `"unknown-host"` rather than failing the whole client over a
/// cosmetic field; `client_host` is informational only, never used for
/// routing or identity.
pub fn resolve() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}
