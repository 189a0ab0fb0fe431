//! TLS configuration
//!
//! This module provides the policy lookups consumed by sessions and the
//! trust context: which trust anchors and revocation lists to load, which
//! client certificate to present, and whether certificate verification
//! failures are fatal for a given host.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Recognized configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsOption {
    /// PEM file holding trusted CA certificates
    TrustAnchorFile,
    /// Directory of trusted CA certificates
    TrustAnchorPath,
    /// PEM file holding one or more CRLs
    RevocationListFile,
    /// Directory of CRL files
    RevocationListPath,
    /// Client private key (defaults to the certificate file)
    ClientKeyFile,
    /// Client certificate
    ClientCertFile,
    /// Whether verification failures abort the handshake (default true)
    VerifyCertificate,
}

impl TlsOption {
    /// All options, in documentation order
    pub const ALL: [TlsOption; 7] = [
        TlsOption::TrustAnchorFile,
        TlsOption::TrustAnchorPath,
        TlsOption::RevocationListFile,
        TlsOption::RevocationListPath,
        TlsOption::ClientKeyFile,
        TlsOption::ClientCertFile,
        TlsOption::VerifyCertificate,
    ];

    /// Get the option name as used in settings text
    pub fn name(&self) -> &'static str {
        match self {
            TlsOption::TrustAnchorFile => "trust-anchor-file",
            TlsOption::TrustAnchorPath => "trust-anchor-path",
            TlsOption::RevocationListFile => "revocation-list-file",
            TlsOption::RevocationListPath => "revocation-list-path",
            TlsOption::ClientKeyFile => "client-key-file",
            TlsOption::ClientCertFile => "client-cert-file",
            TlsOption::VerifyCertificate => "verify-certificate",
        }
    }

    /// Parse an option name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|opt| opt.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for TlsOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Session resumption failed: {0}")]
    SessionResumptionFailed(String),
}

/// Parse a boolean setting value
///
/// Accepts `yes/no`, `on/off`, `true/false` and `1/0`, case-insensitively.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Some(true),
        "no" | "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Source of per-host configuration
///
/// Lookups are keyed by option and, optionally, the target hostname.
/// Implementations return the host-specific value when one exists and the
/// global value otherwise.
pub trait Policy: Send + Sync {
    /// Look up a raw option value
    fn query(&self, option: TlsOption, host: Option<&str>) -> Option<String>;

    /// Look up a path option; empty values count as unset
    fn path(&self, option: TlsOption, host: Option<&str>) -> Option<PathBuf> {
        self.query(option, host)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    /// Whether certificate verification is enforced for `host`
    fn verify_certificate(&self, host: &str) -> bool {
        self.query(TlsOption::VerifyCertificate, Some(host))
            .and_then(|value| parse_bool(&value))
            .unwrap_or(true)
    }
}

impl<F> Policy for F
where
    F: Fn(TlsOption, Option<&str>) -> Option<String> + Send + Sync,
{
    fn query(&self, option: TlsOption, host: Option<&str>) -> Option<String> {
        self(option, host)
    }
}

/// In-memory policy with optional per-host overrides
#[derive(Debug, Clone, Default)]
pub struct PolicyMap {
    global: HashMap<TlsOption, String>,
    hosts: HashMap<(String, TlsOption), String>,
}

impl PolicyMap {
    /// Create an empty policy (every option unset)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a global value
    pub fn set(mut self, option: TlsOption, value: impl Into<String>) -> Self {
        self.global.insert(option, value.into());
        self
    }

    /// Set a value that applies only to `host`
    pub fn set_for_host(
        mut self,
        host: impl Into<String>,
        option: TlsOption,
        value: impl Into<String>,
    ) -> Self {
        self.hosts.insert((host.into(), option), value.into());
        self
    }

    /// Parse settings text
    ///
    /// One `name[/host] value` entry per line. Blank lines and lines
    /// starting with `#` are ignored. The value is the rest of the line and
    /// may be empty, which unsets the option.
    pub fn parse(text: &str) -> Result<Self, TlsError> {
        let mut policy = PolicyMap::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };

            let (name, host) = match key.split_once('/') {
                Some((name, host)) if !host.is_empty() => (name, Some(host)),
                Some((name, _)) => (name, None),
                None => (key, None),
            };

            let option = TlsOption::from_name(name).ok_or_else(|| {
                TlsError::InvalidConfig(format!("line {}: unknown option '{}'", lineno + 1, name))
            })?;

            if option == TlsOption::VerifyCertificate && parse_bool(value).is_none() {
                return Err(TlsError::InvalidConfig(format!(
                    "line {}: '{}' expects a boolean, got '{}'",
                    lineno + 1,
                    name,
                    value
                )));
            }

            policy = match host {
                Some(host) => policy.set_for_host(host, option, value),
                None => policy.set(option, value),
            };
        }

        Ok(policy)
    }
}

impl Policy for PolicyMap {
    fn query(&self, option: TlsOption, host: Option<&str>) -> Option<String> {
        host.and_then(|host| self.hosts.get(&(host.to_string(), option)))
            .or_else(|| self.global.get(&option))
            .cloned()
    }
}
