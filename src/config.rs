use std::path::PathBuf;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub external_url: String,
    pub listen_addr: String,
    pub db_dsn: String,
    pub ca: CaSettings,
    pub acme: AcmeSettings,
    pub mail: MailSettings,
    pub web: WebSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaSettings {
    pub enabled: bool,
    #[serde(deserialize_with = "de_duration")]
    pub cert_lifetime: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub crl_lifetime: Duration,
    pub encryption_key: String,
    #[serde(default)]
    pub import_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeSettings {
    #[serde(default)]
    pub terms_of_service_url: Option<String>,
    pub mail_required: bool,
    pub mail_target_regex: String,
    pub target_domain_regex: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailEncryption {
    Tls,
    StartTls,
    Plain,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub encryption: MailEncryption,
    pub sender: String,
    #[serde(deserialize_with = "de_duration")]
    pub warn_before_cert_expires: Duration,
    pub notify_when_cert_expired: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSettings {
    pub enabled: bool,
    pub enable_public_log: bool,
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let parsed = humantime::parse_duration(&raw).map_err(serde::de::Error::custom)?;
    Ok(Duration::try_from(parsed).map_err(serde::de::Error::custom)?)
}

const DEFAULT_EXTERNAL_URL: &str = "https://localhost:9000/";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_DB_DSN: &str = "memory://";
const DEFAULT_CERT_LIFETIME: &str = "1440h";
const DEFAULT_CRL_LIFETIME: &str = "168h";
const DEFAULT_WARN_BEFORE_CERT_EXPIRES: &str = "720h";
const DEFAULT_TARGET_DOMAIN_REGEX: &str = r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$";
const DEFAULT_MAIL_TARGET_REGEX: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";
const DEFAULT_MAIL_PORT: u16 = 587;
const DEFAULT_MAIL_SENDER: &str = "acme@example.com";

impl Settings {
    /// Creates a new `Settings` instance.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. file not found, invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        s = s
            .set_default("external_url", DEFAULT_EXTERNAL_URL)?
            .set_default("listen_addr", DEFAULT_LISTEN_ADDR)?
            .set_default("db_dsn", DEFAULT_DB_DSN)?
            .set_default("ca.enabled", true)?
            .set_default("ca.cert_lifetime", DEFAULT_CERT_LIFETIME)?
            .set_default("ca.crl_lifetime", DEFAULT_CRL_LIFETIME)?
            .set_default("ca.encryption_key", "")?
            .set_default("acme.mail_required", false)?
            .set_default("acme.mail_target_regex", DEFAULT_MAIL_TARGET_REGEX)?
            .set_default("acme.target_domain_regex", DEFAULT_TARGET_DOMAIN_REGEX)?
            .set_default("mail.host", "localhost")?
            .set_default("mail.port", DEFAULT_MAIL_PORT)?
            .set_default("mail.encryption", "starttls")?
            .set_default("mail.sender", DEFAULT_MAIL_SENDER)?
            .set_default("mail.warn_before_cert_expires", DEFAULT_WARN_BEFORE_CERT_EXPIRES)?
            .set_default("mail.notify_when_cert_expired", true)?
            .set_default("web.enabled", false)?
            .set_default("web.enable_public_log", false)?;

        let path = config_path.unwrap_or_else(|| PathBuf::from("acmed.toml"));
        s = s.add_source(File::from(path).required(false));
        s = s.add_source(Environment::with_prefix("ACMED").separator("__"));

        s.build()?.try_deserialize()
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        if !self.external_url.ends_with('/') {
            anyhow::bail!("external_url must end with '/'");
        }
        if self.ca.enabled && self.ca.encryption_key.trim().is_empty() {
            anyhow::bail!("ca.encryption_key must be set when ca.enabled is true");
        }
        if self.ca.cert_lifetime < Duration::days(1) {
            anyhow::bail!("ca.cert_lifetime must be at least 1 day");
        }
        if self.ca.crl_lifetime < Duration::days(1) {
            anyhow::bail!("ca.crl_lifetime must be at least 1 day");
        }
        Regex::new(&self.acme.mail_target_regex).map_err(|e| anyhow::anyhow!("acme.mail_target_regex is invalid: {e}"))?;
        Regex::new(&self.acme.target_domain_regex)
            .map_err(|e| anyhow::anyhow!("acme.target_domain_regex is invalid: {e}"))?;
        if self.mail.host.trim().is_empty() {
            anyhow::bail!("mail.host must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.external_url, DEFAULT_EXTERNAL_URL);
        assert_eq!(settings.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(settings.ca.cert_lifetime, Duration::hours(1440));
        assert_eq!(settings.mail.encryption, MailEncryption::StartTls);
    }

    #[test]
    fn test_load_settings_file_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            external_url = "https://ca.example.com/"
            listen_addr = "127.0.0.1:8443"
            db_dsn = "memory://"
            [ca]
            enabled = true
            cert_lifetime = "720h"
            crl_lifetime = "24h"
            encryption_key = "dGVzdC1rZXktdGVzdC1rZXktdGVzdC1rZXktdGVzdA"
            [acme]
            mail_required = true
            mail_target_regex = "^.+@example\\.com$"
            target_domain_regex = "^example\\.com$"
            [mail]
            host = "smtp.example.com"
            port = 25
            encryption = "tls"
            sender = "ca@example.com"
            warn_before_cert_expires = "48h"
            notify_when_cert_expired = false
            [web]
            enabled = false
            enable_public_log = false
        "#
        )
        .unwrap();
        file.flush().unwrap();

        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(settings.external_url, "https://ca.example.com/");
        assert_eq!(settings.ca.cert_lifetime, Duration::hours(720));
        assert_eq!(settings.mail.encryption, MailEncryption::Tls);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_external_url_without_trailing_slash() {
        let mut settings = Settings::new(None).unwrap();
        settings.external_url = "https://ca.example.com".into();
        settings.ca.encryption_key = "x".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("external_url"));
    }

    #[test]
    fn test_validate_requires_encryption_key_when_ca_enabled() {
        let mut settings = Settings::new(None).unwrap();
        settings.ca.enabled = true;
        settings.ca.encryption_key = String::new();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("encryption_key"));
    }
}
