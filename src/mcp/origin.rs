//! Browser `Origin` allow-list.
//!
//! Origins are compared structurally (scheme, host, optional port), never
//! by string prefix, so `http://localhost.evil.example` does not match an
//! allow-list entry of `http://localhost`.

use tracing::warn;

use crate::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedOrigin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl ParsedOrigin {
    fn parse(raw: &str) -> Option<Self> {
        let (scheme, rest) = raw.trim().split_once("://")?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
        {
            return None;
        }
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.is_empty() || authority.contains(['/', '?', '#', '@', ' ']) {
            return None;
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (inner, after) = bracketed.split_once(']')?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':')?.parse().ok()?),
            };
            (format!("[{inner}]"), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_owned(), Some(port.parse().ok()?)),
                None => (authority.to_owned(), None),
            }
        };
        if host.is_empty() || host == "[]" {
            return None;
        }
        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// An entry without a port admits any port on that scheme and host.
    fn admits(&self, origin: &Self) -> bool {
        self.scheme == origin.scheme
            && self.host == origin.host
            && match self.port {
                Some(port) => origin.port == Some(port),
                None => true,
            }
    }
}

/// Compiled allow-list.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<ParsedOrigin>,
}

impl OriginPolicy {
    /// Compile the configured entries; malformed entries are skipped.
    #[must_use]
    pub fn new(entries: &[String]) -> Self {
        let allowed = entries
            .iter()
            .filter_map(|entry| {
                let parsed = ParsedOrigin::parse(entry);
                if parsed.is_none() {
                    warn!(entry, "ignoring malformed allowed_origins entry");
                }
                parsed
            })
            .collect();
        Self { allowed }
    }

    /// Admit a request by its `Origin` header; absent is allowed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnauthorizedOrigin` when the origin is present
    /// and matches no entry.
    pub fn check(&self, origin: Option<&str>) -> Result<()> {
        let Some(raw) = origin else {
            return Ok(());
        };
        let admitted = ParsedOrigin::parse(raw)
            .is_some_and(|parsed| self.allowed.iter().any(|entry| entry.admits(&parsed)));
        if admitted {
            Ok(())
        } else {
            Err(AppError::UnauthorizedOrigin(raw.to_owned()))
        }
    }
}
