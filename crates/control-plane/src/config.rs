use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer};

use crate::backup::StorageMode;

pub const ENV_PREFIX: &str = "AERO_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub tunnel: TunnelConfig,
    pub file_tunnel: FileTunnelConfig,
    pub backups: BackupsConfig,
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Address the tunnel listener binds to.
    pub host: String,
    pub port: u16,
    /// How frequently agents send heartbeat frames on the tunnel.
    #[serde(default = "default_tunnel_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// How long the plane waits for a heartbeat before closing the tunnel.
    #[serde(default = "default_tunnel_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Header carrying the agent bearer token during CONNECT and on the
    /// long-poll endpoints.
    #[serde(default = "default_tunnel_token_header")]
    pub token_header: String,
    /// Bearer tokens accepted from agents.
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub agent_tokens: Vec<String>,
    /// Default deadline for correlated commands.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Overall deadline for one binary stream.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileTunnelConfig {
    /// Admission limit: in-flight plus queued requests per node.
    pub max_pending_per_node: usize,
    /// Admission limit on staged upload payloads.
    pub max_upload_mb: u64,
    /// Deadline for a queued request to be resolved.
    pub request_timeout_secs: u64,
    /// How long a poll call parks before resolving empty.
    pub poll_timeout_secs: u64,
    /// Staged uploads older than this are swept regardless of pending state.
    pub upload_ttl_secs: u64,
    pub gc_interval_secs: u64,
}

impl FileTunnelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_pending_per_node == 0 {
            anyhow::bail!("file_tunnel.max_pending_per_node must be > 0");
        }
        if self.request_timeout_secs == 0 || self.poll_timeout_secs == 0 {
            anyhow::bail!("file_tunnel timeouts must be > 0");
        }
        if self.upload_ttl_secs == 0 {
            anyhow::bail!("file_tunnel.upload_ttl_secs must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupsConfig {
    /// Global default storage mode; servers may override it.
    pub mode: StorageMode,
    /// Agent-side directory holding server volumes and their archives.
    pub base_dir: String,
    /// Agent-side staging directory used by `stream` mode as a relay buffer.
    pub stream_dir: String,
    /// Control-plane directory backing `local` mode and the `stream` relay.
    pub local_dir: String,
    pub retention: RetentionConfig,
    pub s3: S3Config,
    pub sftp: SftpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Keep at most this many archives per server; 0 disables the rule.
    pub count: i64,
    /// Remove archives older than this many days; 0 disables the rule.
    pub days: i64,
}

impl RetentionConfig {
    /// Negative values are treated as disabled.
    pub fn clamped(&self) -> (u64, u64) {
        (self.count.max(0) as u64, self.days.max(0) as u64)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: String,
    /// May be stored as a `v1:` encrypted envelope.
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SftpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// May be stored as a `v1:` encrypted envelope.
    #[serde(default)]
    pub password: Option<String>,
    /// May be stored as a `v1:` encrypted envelope.
    #[serde(default)]
    pub private_key: Option<String>,
    /// May be stored as a `v1:` encrypted envelope.
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub base_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// Base64-encoded 32-byte key for credential encryption. Empty disables
    /// envelope decryption; encrypted values then fail fast at use.
    #[serde(default)]
    pub master_key: String,
}

impl SecretsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.master_key.is_empty() {
            return Ok(());
        }
        let decoded = general_purpose::STANDARD
            .decode(&self.master_key)
            .map_err(|err| anyhow::anyhow!("secrets.master_key is not valid base64: {err}"))?;
        if decoded.len() != 32 {
            anyhow::bail!(
                "secrets.master_key must decode to 32 bytes, got {}",
                decoded.len()
            );
        }
        Ok(())
    }
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

fn default_tunnel_heartbeat_interval_secs() -> u64 {
    30
}

fn default_tunnel_heartbeat_timeout_secs() -> u64 {
    90
}

fn default_tunnel_token_header() -> String {
    "x-aero-tunnel-token".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_stream_timeout_secs() -> u64 {
    15 * 60
}

fn default_sftp_port() -> u16 {
    22
}

impl TunnelConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("tunnel.host cannot be empty");
        }
        if self.port == 0 {
            anyhow::bail!("tunnel.port must be > 0");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("tunnel.heartbeat_interval_secs must be > 0");
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            anyhow::bail!("tunnel.heartbeat_timeout_secs must exceed heartbeat interval");
        }
        if self.token_header.trim().is_empty() {
            anyhow::bail!("tunnel.token_header cannot be empty");
        }
        if self.agent_tokens.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("tunnel.agent_tokens cannot be empty");
        }
        if self.command_timeout_secs == 0 || self.stream_timeout_secs == 0 {
            anyhow::bail!("tunnel timeouts must be > 0");
        }
        Ok(())
    }
}

impl BackupsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, dir) in [
            ("backups.base_dir", &self.base_dir),
            ("backups.stream_dir", &self.stream_dir),
            ("backups.local_dir", &self.local_dir),
        ] {
            if dir.trim().is_empty() {
                anyhow::bail!("{name} cannot be empty");
            }
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9090)?
        .set_default("tunnel.host", "0.0.0.0")?
        .set_default("tunnel.port", 7443)?
        .set_default(
            "tunnel.heartbeat_interval_secs",
            default_tunnel_heartbeat_interval_secs(),
        )?
        .set_default(
            "tunnel.heartbeat_timeout_secs",
            default_tunnel_heartbeat_timeout_secs(),
        )?
        .set_default("tunnel.token_header", default_tunnel_token_header())?
        .set_default("tunnel.agent_tokens", vec!["dev-agent-token"])?
        .set_default("tunnel.command_timeout_secs", default_command_timeout_secs())?
        .set_default("tunnel.stream_timeout_secs", default_stream_timeout_secs())?
        .set_default("file_tunnel.max_pending_per_node", 32i64)?
        .set_default("file_tunnel.max_upload_mb", 100i64)?
        .set_default("file_tunnel.request_timeout_secs", 60i64)?
        .set_default("file_tunnel.poll_timeout_secs", 30i64)?
        .set_default("file_tunnel.upload_ttl_secs", 300i64)?
        .set_default("file_tunnel.gc_interval_secs", 60i64)?
        .set_default("backups.mode", "local")?
        .set_default("backups.base_dir", "/var/lib/aero/volumes")?
        .set_default("backups.stream_dir", "/var/lib/aero/stream")?
        .set_default("backups.local_dir", "data/backups")?
        .set_default("backups.retention.count", 0i64)?
        .set_default("backups.retention.days", 0i64)?
        .set_default("backups.s3.bucket", "")?
        .set_default("backups.s3.region", "")?
        .set_default("backups.s3.endpoint", Option::<String>::None)?
        .set_default("backups.s3.access_key", "")?
        .set_default("backups.s3.secret_key", "")?
        .set_default("backups.sftp.host", "")?
        .set_default("backups.sftp.port", 22i64)?
        .set_default("backups.sftp.username", "")?
        .set_default("backups.sftp.password", Option::<String>::None)?
        .set_default("backups.sftp.private_key", Option::<String>::None)?
        .set_default("backups.sftp.passphrase", Option::<String>::None)?
        .set_default("backups.sftp.base_path", "")?
        .set_default("secrets.master_key", "")?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.tunnel.token_header = app.tunnel.token_header.trim().to_ascii_lowercase();
    app.tunnel
        .agent_tokens
        .retain(|token| !token.trim().is_empty());
    app.tunnel.validate()?;
    app.file_tunnel.validate()?;
    app.backups.validate()?;
    app.secrets.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        for (key, _) in &existing {
            env::remove_var(key);
        }

        for (key, value) in vars {
            env::set_var(key, value);
        }

        let result = panic::catch_unwind(test);

        for (key, _) in vars {
            env::remove_var(key);
        }

        for (key, value) in existing {
            env::set_var(key, value);
        }

        result.unwrap();
    }

    #[test]
    fn defaults_load_and_validate() {
        with_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.file_tunnel.max_pending_per_node, 32);
            assert_eq!(cfg.file_tunnel.request_timeout_secs, 60);
            assert_eq!(cfg.file_tunnel.poll_timeout_secs, 30);
            assert_eq!(cfg.file_tunnel.upload_ttl_secs, 300);
            assert_eq!(cfg.backups.mode, StorageMode::Local);
            assert_eq!(cfg.tunnel.agent_tokens, vec!["dev-agent-token"]);
        });
    }

    #[test]
    fn numeric_agent_tokens_remain_strings() {
        with_plane_env(
            &[("AERO_CP__TUNNEL__AGENT_TOKENS", "1111,2222")],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(
                    cfg.tunnel.agent_tokens,
                    vec!["1111".to_string(), "2222".to_string()]
                );
            },
        );
    }

    #[test]
    fn storage_mode_parses_from_env() {
        with_plane_env(&[("AERO_CP__BACKUPS__MODE", "sftp")], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.backups.mode, StorageMode::Sftp);
        });
    }

    #[test]
    fn retention_clamps_negative_values() {
        let retention = RetentionConfig {
            count: -3,
            days: 14,
        };
        assert_eq!(retention.clamped(), (0, 14));
    }

    #[test]
    fn master_key_must_be_32_bytes() {
        let short = SecretsConfig {
            master_key: general_purpose::STANDARD.encode([0u8; 16]),
        };
        assert!(short.validate().is_err());

        let ok = SecretsConfig {
            master_key: general_purpose::STANDARD.encode([0u8; 32]),
        };
        assert!(ok.validate().is_ok());

        let empty = SecretsConfig {
            master_key: String::new(),
        };
        assert!(empty.validate().is_ok());
    }
}
