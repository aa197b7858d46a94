//! Environment driven configuration.
//!
//! Every pipeline host is configured exclusively through environment
//! variables (optionally via a `.env` file). Required values that are
//! missing or empty are fatal at startup.

use secrecy::SecretString;

use crate::email::ncmec::{NcmecCredentials, NcmecReporter};
use crate::error::ConfigError;

/// Credentials for the IMAP and SMTP sessions.
#[derive(Clone)]
pub struct MailCredentials {
    /// Server address including port, e.g. `imap.gmail.com:993`.
    pub address: String,
    pub username: String,
    pub password: SecretString,
}

/// Optional NCMEC reporting block, enabled by
/// `ABUSE_NCMEC_REPORTING_ENABLED`.
#[derive(Clone)]
pub struct NcmecConfig {
    pub credentials: NcmecCredentials,
    pub reporter: NcmecReporter,
}

/// Scanner configuration, loaded once at startup.
#[derive(Clone)]
pub struct Config {
    pub mail: MailCredentials,
    /// Name of the mailbox that is scanned for abuse reports.
    pub mailbox: String,
    /// Destination address for the summary replies.
    pub abuse_mailaddress: String,
    /// Identifies this host in `inserted_by`/`parsed_by`/... stamps and in
    /// the lock collection.
    pub server_domain: String,
    /// Base URL of the blocker API.
    pub blocker_api_url: String,
    /// Connection string for the shared database.
    pub database_url: String,
    /// Sponsor label attached to every parse result.
    pub sponsor: String,
    /// Log level directive, defaults to `info`.
    pub log_level: String,
    /// Portal URL used to construct report URLs, sanitized.
    pub portal_url: String,
    /// Base URL of the uploader-info (accounts) API.
    pub accounts_api_url: String,
    pub ncmec: Option<NcmecConfig>,
}

impl Config {
    /// Loads the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mail = MailCredentials {
            address: require_env("EMAIL_SERVER")?,
            username: require_env("EMAIL_USERNAME")?,
            password: SecretString::from(require_env("EMAIL_PASSWORD")?),
        };

        let blocker_host = require_env("BLOCKER_HOST")?;
        let blocker_port = require_env("BLOCKER_PORT")?;
        let accounts_host = require_env("ACCOUNTS_HOST")?;
        let accounts_port = require_env("ACCOUNTS_PORT")?;

        let ncmec = match optional_bool_env("ABUSE_NCMEC_REPORTING_ENABLED")? {
            true => Some(NcmecConfig {
                credentials: NcmecCredentials::from_env()?,
                reporter: NcmecReporter::from_env()?,
            }),
            false => None,
        };

        Ok(Config {
            mail,
            mailbox: trim_quotes(&require_env("ABUSE_MAILBOX")?),
            abuse_mailaddress: require_env("ABUSE_MAILADDRESS")?,
            server_domain: require_env("SERVER_DOMAIN")?,
            blocker_api_url: format!("http://{}:{}", blocker_host, blocker_port),
            database_url: require_env("DATABASE_URL")?,
            sponsor: trim_quotes(&require_env("ABUSE_SPONSOR")?),
            log_level: std::env::var("ABUSE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            portal_url: sanitize_portal_url(&require_env("ABUSE_PORTAL_URL")?),
            accounts_api_url: format!("{}:{}", accounts_host, accounts_port),
            ncmec,
        })
    }
}

/// Reads a required env var, rejecting missing and empty values.
pub fn require_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Err(ConfigError::EmptyEnv(name.to_string())),
        Ok(value) => Ok(value),
        Err(_) => Err(ConfigError::MissingEnv(name.to_string())),
    }
}

/// Reads an optional boolean env var; unset or empty means `false`.
fn optional_bool_env(name: &str) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(false),
        Ok(value) => value
            .parse::<bool>()
            .map_err(|_| ConfigError::InvalidBool(name.to_string())),
        Err(_) => Ok(false),
    }
}

/// Strips surrounding double quotes, which leak in from some container env
/// files.
fn trim_quotes(value: &str) -> String {
    value.trim_matches('"').to_string()
}

/// Sanitizes a portal URL: trims whitespace, strips trailing slashes and
/// forces an https scheme.
pub fn sanitize_portal_url(portal_url: &str) -> String {
    let url = portal_url.trim();
    let url = url.strip_suffix('/').unwrap_or(url);
    if url.starts_with("https://") {
        return url.to_string();
    }
    let url = url.strip_prefix("http://").unwrap_or(url);
    if url.is_empty() {
        return String::new();
    }
    format!("https://{}", url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_portal_url() {
        assert_eq!(sanitize_portal_url("siasky.net"), "https://siasky.net");
        assert_eq!(
            sanitize_portal_url("http://siasky.net"),
            "https://siasky.net"
        );
        assert_eq!(
            sanitize_portal_url("https://siasky.net/"),
            "https://siasky.net"
        );
        assert_eq!(
            sanitize_portal_url("  https://siasky.net  "),
            "https://siasky.net"
        );
        assert_eq!(sanitize_portal_url(""), "");
    }

    #[test]
    fn test_trim_quotes() {
        assert_eq!(trim_quotes("\"INBOX\""), "INBOX");
        assert_eq!(trim_quotes("INBOX"), "INBOX");
        assert_eq!(trim_quotes("\"\""), "");
    }

    #[test]
    fn test_require_env() {
        std::env::set_var("ABUSE_SCANNER_TEST_SET", "value");
        std::env::set_var("ABUSE_SCANNER_TEST_EMPTY", "");
        assert_eq!(require_env("ABUSE_SCANNER_TEST_SET").unwrap(), "value");
        assert!(matches!(
            require_env("ABUSE_SCANNER_TEST_EMPTY"),
            Err(ConfigError::EmptyEnv(_))
        ));
        assert!(matches!(
            require_env("ABUSE_SCANNER_TEST_MISSING"),
            Err(ConfigError::MissingEnv(_))
        ));
    }
}
