//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. Values like the directory URL
//! may embed credentials (`redis://:password@host:port`), so they are
//! carried as [`SecretString`]: `Debug` prints a redaction marker, and the
//! inner value is only reachable through an explicit
//! [`ExposeSecret::expose_secret`] call at the point of use.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@db:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert_eq!(url.expose_secret(), "redis://:hunter2@db:6379");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@db:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("redis://127.0.0.1:6379");
        assert_eq!(secret.expose_secret(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Endpoint {
            name: String,
            url: SecretString,
        }

        let endpoint = Endpoint {
            name: "directory".to_string(),
            url: SecretString::from("redis://:super-secret@db:6379"),
        };

        let debug_str = format!("{endpoint:?}");

        assert!(debug_str.contains("directory"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }
}
