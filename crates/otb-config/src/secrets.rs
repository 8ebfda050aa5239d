//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only env var NAMES (`auth.key_env`,
//!   `store.database_url_env`).
//! - Binaries resolve secrets once at startup and pass the values into
//!   constructors; nothing else calls `std::env::var` for them.
//! - `Debug` redacts values. Errors name the variable, never the value.

use anyhow::{bail, Result};

use crate::{AuthConfig, StoreConfig};

/// Key used when the named env var is not set. Matches devices shipped with
/// the factory default.
pub const DEFAULT_AUTH_KEY: i16 = 0xBEEFu16 as i16;

/// Where a resolved auth key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Env,
    /// The env var was absent or blank; [`DEFAULT_AUTH_KEY`] is in use.
    Default,
}

/// Shared device authentication key as a register word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey {
    value: i16,
    source: KeySource,
}

impl AuthKey {
    pub fn new(value: i16) -> Self {
        Self {
            value,
            source: KeySource::Env,
        }
    }

    pub fn value(&self) -> i16 {
        self.value
    }

    pub fn source(&self) -> KeySource {
        self.source
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKey")
            .field("value", &"<REDACTED>")
            .field("source", &self.source)
            .finish()
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Parse a key as written by operators: decimal (`-16657`, `48879`) or hex
/// (`0xBEEF`). Anything in `i16::MIN..=u16::MAX` is accepted; values above
/// `i16::MAX` keep their bit pattern.
pub fn parse_key(raw: &str) -> Option<i16> {
    let t = raw.trim();
    let wide: i64 = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => t.parse().ok()?,
    };
    if wide < i64::from(i16::MIN) || wide > i64::from(u16::MAX) {
        return None;
    }
    Some(wide as u16 as i16)
}

/// Resolve the device key from the env var named by `auth.key_env`.
///
/// Absent or blank ⇒ [`DEFAULT_AUTH_KEY`] with [`KeySource::Default`]; the
/// caller is expected to warn.
///
/// # Errors
/// The variable is set but not a 16-bit value.
pub fn resolve_auth_key(auth: &AuthConfig) -> Result<AuthKey> {
    match resolve_env(&auth.key_env) {
        None => Ok(AuthKey {
            value: DEFAULT_AUTH_KEY,
            source: KeySource::Default,
        }),
        Some(raw) => match parse_key(&raw) {
            Some(value) => Ok(AuthKey::new(value)),
            None => bail!(
                "SECRETS_INVALID: env var '{}' is not a 16-bit key",
                auth.key_env
            ),
        },
    }
}

/// Database connection string; redacted in `Debug`.
#[derive(Clone)]
pub struct DatabaseUrl(String);

impl DatabaseUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DatabaseUrl(<REDACTED>)")
    }
}

/// # Errors
/// The env var named by `store.database_url_env` is unset or blank.
pub fn resolve_database_url(store: &StoreConfig) -> Result<DatabaseUrl> {
    match resolve_env(&store.database_url_env) {
        Some(url) => Ok(DatabaseUrl(url)),
        None => bail!(
            "SECRETS_MISSING: required env var '{}' (database url) is not set or empty",
            store.database_url_env
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_accepts_decimal_and_hex() {
        assert_eq!(parse_key("0xBEEF"), Some(DEFAULT_AUTH_KEY));
        assert_eq!(parse_key("48879"), Some(DEFAULT_AUTH_KEY));
        assert_eq!(parse_key("-16657"), Some(DEFAULT_AUTH_KEY));
        assert_eq!(parse_key(" 12 "), Some(12));
        assert_eq!(parse_key("65536"), None);
        assert_eq!(parse_key("-32769"), None);
        assert_eq!(parse_key("beef"), None);
    }

    #[test]
    fn debug_never_prints_the_key() {
        let k = AuthKey::new(1234);
        let s = format!("{k:?}");
        assert!(!s.contains("1234"), "{s}");
        assert!(s.contains("REDACTED"));
    }

    #[test]
    fn unset_var_falls_back_to_factory_key() {
        let auth = AuthConfig {
            key_env: "OTB_TEST_KEY_THAT_IS_NEVER_SET_5f1c".to_string(),
        };
        let k = resolve_auth_key(&auth).unwrap();
        assert_eq!(k.value(), DEFAULT_AUTH_KEY);
        assert_eq!(k.source(), KeySource::Default);
    }

    #[test]
    fn missing_database_url_names_the_variable() {
        let store = StoreConfig {
            database_url_env: "OTB_TEST_DB_URL_NEVER_SET_5f1c".to_string(),
            ..StoreConfig::default()
        };
        let err = resolve_database_url(&store).unwrap_err().to_string();
        assert!(err.contains("OTB_TEST_DB_URL_NEVER_SET_5f1c"), "{err}");
    }
}
