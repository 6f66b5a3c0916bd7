use std::path::Path;

use tracing::warn;

use crate::crypto::{Method, strip_auth_suffix};
use crate::error::{RelayError, Result};

use super::types::*;

impl RelayConfig {
    /// Parse the file. Validation is left to the caller so command-line
    /// overrides can be applied first.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(&path).map_err(|e| RelayError::Config(e.to_string()))?;

        let mut config: RelayConfig =
            toml::from_str(&content).map_err(|e| RelayError::Config(e.to_string()))?;

        config.normalize();
        Ok(config)
    }

    /// Fold a `-auth` method suffix into the `auth` flag.
    pub fn normalize(&mut self) {
        let (bare, forced) = strip_auth_suffix(&self.general.method);
        if forced {
            self.general.method = bare.to_string();
            self.general.auth = true;
        }
    }

    pub fn method(&self) -> Result<Method> {
        self.general.method.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.method()?;

        if self.timeouts.client_read == 0 {
            return Err(RelayError::Config(
                "timeouts.client_read must be > 0".to_string(),
            ));
        }

        if self.timeouts.connect == 0 {
            return Err(RelayError::Config(
                "timeouts.connect must be > 0".to_string(),
            ));
        }

        if self.metering.flush_interval_secs == 0
            || self.metering.flush_interval_secs > MAX_FLUSH_INTERVAL_SECS
        {
            return Err(RelayError::Config(format!(
                "metering.flush_interval_secs must be between 1 and {MAX_FLUSH_INTERVAL_SECS}"
            )));
        }

        if let Some(db) = &self.database {
            if self.general.server_tag.trim().is_empty() {
                return Err(RelayError::Config(
                    "general.server_tag is required when [database] is set".to_string(),
                ));
            }
            if db.min_connections > db.max_connections {
                return Err(RelayError::Config(format!(
                    "database.min_connections ({}) exceeds max_connections ({})",
                    db.min_connections, db.max_connections
                )));
            }
            if !self.tenants.is_empty() {
                warn!("[tenants] is ignored while [database] is the tenant source");
            }
        }

        for (port, tenant) in &self.tenants {
            if *port == 0 {
                return Err(RelayError::Config("tenant port 0 is not valid".to_string()));
            }
            if tenant.password.is_empty() {
                return Err(RelayError::Config(format!("tenant {port} has an empty password")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CliOverrides;

    fn load_str(name: &str, toml: &str) -> Result<RelayConfig> {
        let path = std::env::temp_dir().join(format!("ssrelay_{}_{name}.toml", std::process::id()));
        std::fs::write(&path, toml).unwrap();
        let cfg = RelayConfig::load(&path);
        let _ = std::fs::remove_file(path);
        let cfg = cfg?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn tenants_allow_string_and_table() {
        let toml = r#"
            [tenants]
            8388 = "barfoo!"
            "8389" = { password = "foobar", id = 12 }
        "#;
        let cfg: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.tenants[&8388], Tenant::new("barfoo!", None));
        assert_eq!(cfg.tenants[&8389], Tenant { password: "foobar".into(), id: Some(12) });
    }

    #[test]
    fn tenant_key_must_be_port() {
        let toml = r#"
            [tenants]
            web = "barfoo!"
        "#;
        assert!(toml::from_str::<RelayConfig>(toml).is_err());
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = load_str("defaults", "[tenants]\n8388 = \"pw\"\n").unwrap();
        assert_eq!(cfg.general.method, "aes-256-ctr");
        assert!(!cfg.general.auth);
        assert_eq!(cfg.server.listen_addr, "0.0.0.0");
        assert_eq!(cfg.timeouts.client_read, 300);
        assert_eq!(cfg.timeouts.relay_idle, 0);
        assert_eq!(cfg.metering.flush_interval_secs, 14);
        assert_eq!(cfg.metering.failsafe_log, "dbfail.log");
        assert!(cfg.database.is_none());
        assert_eq!(cfg.server.status_whitelist.len(), 2);
    }

    #[test]
    fn auth_suffix_turns_auth_on() {
        let cfg = load_str(
            "auth_suffix",
            r#"
            [general]
            method = "chacha20-auth"
            [tenants]
            8388 = "pw"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.general.method, "chacha20");
        assert!(cfg.general.auth);
        assert_eq!(cfg.method().unwrap(), Method::ChaCha20);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = load_str("bad_method", "[general]\nmethod = \"rc4-md5\"\n").unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedMethod(_)));
    }

    #[test]
    fn zero_flush_interval_is_rejected() {
        let err = load_str("zero_flush", "[metering]\nflush_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn huge_flush_interval_is_rejected() {
        let err = load_str("huge_flush", "[metering]\nflush_interval_secs = 9223372036854775807\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let cfg = load_str("day_flush", "[metering]\nflush_interval_secs = 86400\n").unwrap();
        assert_eq!(cfg.metering.flush_interval_secs, MAX_FLUSH_INTERVAL_SECS);
    }

    #[test]
    fn method_flag_replaces_bad_file_method() {
        let path = std::env::temp_dir().join(format!("ssrelay_{}_flag_method.toml", std::process::id()));
        std::fs::write(&path, "[general]\nmethod = \"rc4-md5\"\n[tenants]\n8388 = \"pw\"\n").unwrap();
        let mut cfg = RelayConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(path);
        assert!(cfg.validate().is_err());

        let overrides = CliOverrides { method: Some("chacha20-ietf".into()), ..Default::default() };
        overrides.apply(&mut cfg);
        cfg.validate().unwrap();
        assert_eq!(cfg.method().unwrap(), Method::ChaCha20Ietf);
    }

    #[test]
    fn zero_client_read_is_rejected() {
        let err = load_str("zero_read", "[timeouts]\nclient_read = 0\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn database_requires_server_tag() {
        let err = load_str(
            "no_tag",
            r#"
            [database]
            url = "mysql://ss:ss@127.0.0.1/ss"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let cfg = load_str(
            "with_tag",
            r#"
            [general]
            server_tag = "node-1"
            [database]
            url = "mysql://ss:ss@127.0.0.1/ss"
        "#,
        )
        .unwrap();
        let db = cfg.database.unwrap();
        assert_eq!(db.max_connections, 70);
        assert_eq!(db.min_connections, 10);
    }

    #[test]
    fn empty_password_is_rejected() {
        let err = load_str("empty_pw", "[tenants]\n8388 = \"\"\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn port_zero_is_rejected() {
        let err = load_str("port_zero", "[tenants]\n0 = \"pw\"\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
