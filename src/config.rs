//! YAML configuration.
//!
//! A config file is optional; every field has a default. Loading applies
//! the `HCLOUD_TOKEN` environment fallback, expands the side-car process
//! environment, and validates cross-field constraints.

use serde::Deserialize;
use serde_yaml::Mapping;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::template;

/// Environment variable consulted when `hcloud_token` is empty.
pub const HCLOUD_TOKEN_ENV: &str = "HCLOUD_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub autoscaler: AutoscalerOpts,

    /// One listener per key (`"host:port"`), routed to the given upstream.
    #[serde(default)]
    pub listen_addr: HashMap<String, UpstreamOpts>,

    #[serde(default)]
    pub procs: ProcsOpts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoscalerOpts {
    pub hcloud_token: String,

    /// Hard cap on the lifetime of a single proxied connection.
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Idle window after the last interaction before the server is deleted.
    /// Must exceed `connection_timeout`.
    #[serde(with = "humantime_serde")]
    pub scaledown_after: Duration,

    pub server_name_prefix: String,
    pub server_type: String,
    pub server_image: String,
    pub server_location: Option<String>,

    /// Optional through-tunnel readiness probe performed after creating a
    /// server.
    pub wait_for: Option<UpstreamOpts>,

    /// Arbitrary YAML handed to the server as user-data after `${NAME}`
    /// substitution.
    pub cloud_init_template: Mapping,
    pub cloud_init_variables: HashMap<String, String>,
    /// Additional variables from a YAML file; values may be encrypted.
    pub cloud_init_variables_from: Option<PathBuf>,
}

impl Default for AutoscalerOpts {
    fn default() -> Self {
        Self {
            hcloud_token: String::new(),
            connection_timeout: Duration::from_secs(10 * 60),
            scaledown_after: Duration::from_secs(15 * 60),
            server_name_prefix: "autoscaler".to_string(),
            server_type: "cpx31".to_string(),
            server_image: "docker-ce".to_string(),
            server_location: None,
            wait_for: None,
            cloud_init_template: default_cloud_init_template(),
            cloud_init_variables: HashMap::new(),
            cloud_init_variables_from: None,
        }
    }
}

/// Ships a docker-ready server with the generated host key installed and
/// the controller's key authorized for the `autoscaler` user.
const DEFAULT_CLOUD_INIT_TEMPLATE: &str = r#"
groups: ["docker"]
ssh_pwauth: false
ssh_keys:
  rsa_private: "${SERVER_RSA_PRIVATE}"
  rsa_public: "${SERVER_RSA_PUBLIC}"
users:
  - default
  - name: autoscaler
    groups: users,docker
    lock_passwd: true
    ssh_authorized_keys: ["${AUTOSCALER_AUTHORIZED_KEY}"]
"#;

fn default_cloud_init_template() -> Mapping {
    serde_yaml::from_str(DEFAULT_CLOUD_INIT_TEMPLATE)
        .expect("default cloud-init template is valid YAML")
}

/// Where to dial through the tunnel: a TCP `host:port` or a Unix socket
/// path on the server.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UpstreamOpts {
    pub net: UpstreamNet,
    pub addr: String,
    /// Optional name, seeds `${autoscaler.listen.<name>}` variables for the
    /// side-car processes.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamNet {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcsOpts {
    /// Shell commands run as side-cars for the lifetime of the proxy.
    #[serde(default)]
    pub run: Vec<String>,

    /// Environment for the side-cars, templated with
    /// `${autoscaler.listen.<name>}` and `${env.NAME}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_fallbacks();
        config.patch_procs_env();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults, still honoring the token env fallback.
    pub fn from_defaults() -> Self {
        let mut config = Config::default();
        config.apply_env_fallbacks();
        config
    }

    fn apply_env_fallbacks(&mut self) {
        if self.autoscaler.hcloud_token.is_empty() {
            if let Ok(token) = std::env::var(HCLOUD_TOKEN_ENV) {
                self.autoscaler.hcloud_token = token;
            }
        }
    }

    /// Expand `${autoscaler.listen.<name>}` and `${env.NAME}` tokens in the
    /// side-car process environment.
    fn patch_procs_env(&mut self) {
        let mut variables = HashMap::new();
        for (addr, upstream) in &self.listen_addr {
            if let Some(name) = &upstream.name {
                variables.insert(format!("autoscaler.listen.{name}"), addr.clone());
            }
        }
        let lookup = template::with_env(template::map_lookup(&variables));
        self.procs.env = template::render_map(&lookup, &self.procs.env);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // A connection force-closed by the hard timeout must be observed
        // before the idle window can elapse.
        if self.autoscaler.scaledown_after <= self.autoscaler.connection_timeout {
            return Err(ConfigError::ScaledownTooShort {
                scaledown_after: self.autoscaler.scaledown_after,
                connection_timeout: self.autoscaler.connection_timeout,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(content: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        Config::load(file.path())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(
            config.autoscaler.connection_timeout,
            Duration::from_secs(600)
        );
        assert_eq!(config.autoscaler.scaledown_after, Duration::from_secs(900));
        assert_eq!(config.autoscaler.server_name_prefix, "autoscaler");
        assert_eq!(config.autoscaler.server_type, "cpx31");
        assert_eq!(config.autoscaler.server_image, "docker-ce");
        assert!(config.autoscaler.server_location.is_none());
        assert!(config.listen_addr.is_empty());
        assert!(config.procs.run.is_empty());

        let template = serde_yaml::to_string(&config.autoscaler.cloud_init_template).unwrap();
        assert!(template.contains("${SERVER_RSA_PRIVATE}"));
        assert!(template.contains("${AUTOSCALER_AUTHORIZED_KEY}"));

        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = load_str(
            r#"
autoscaler:
  hcloud_token: secret-token
  connection_timeout: 5m
  scaledown_after: 8m
  server_name_prefix: worker
  server_type: cx22
  server_image: ubuntu-24.04
  server_location: fsn1
  wait_for:
    net: unix
    addr: /var/run/docker.sock
  cloud_init_variables:
    EXTRA: value
listen_addr:
  "127.0.0.1:2375":
    net: unix
    addr: /var/run/docker.sock
    name: docker
  "127.0.0.1:8080":
    net: tcp
    addr: 127.0.0.1:80
procs:
  run:
    - echo hello
  env:
    DOCKER_HOST: "tcp://${autoscaler.listen.docker}"
"#,
        )
        .unwrap();

        assert_eq!(config.autoscaler.hcloud_token, "secret-token");
        assert_eq!(config.autoscaler.connection_timeout, Duration::from_secs(300));
        assert_eq!(config.autoscaler.scaledown_after, Duration::from_secs(480));
        assert_eq!(config.autoscaler.server_location.as_deref(), Some("fsn1"));
        assert_eq!(
            config.autoscaler.wait_for,
            Some(UpstreamOpts {
                net: UpstreamNet::Unix,
                addr: "/var/run/docker.sock".to_string(),
                name: None,
            })
        );

        let docker = &config.listen_addr["127.0.0.1:2375"];
        assert_eq!(docker.net, UpstreamNet::Unix);
        assert_eq!(docker.name.as_deref(), Some("docker"));
        assert_eq!(
            config.listen_addr["127.0.0.1:8080"].net,
            UpstreamNet::Tcp
        );

        // Listener name expanded into the side-car environment.
        assert_eq!(config.procs.env["DOCKER_HOST"], "tcp://127.0.0.1:2375");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = load_str(
            r#"
autoscaler:
  hcloud_token: t
"#,
        )
        .unwrap();

        assert_eq!(config.autoscaler.server_type, "cpx31");
        assert_eq!(config.autoscaler.scaledown_after, Duration::from_secs(900));
    }

    #[test]
    fn test_scaledown_must_exceed_connection_timeout() {
        let err = load_str(
            r#"
autoscaler:
  connection_timeout: 10m
  scaledown_after: 10m
"#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::ScaledownTooShort { .. }));
    }

    #[test]
    fn test_token_env_fallback() {
        std::env::set_var(HCLOUD_TOKEN_ENV, "from-env");
        let config = load_str("autoscaler: {}\n").unwrap();
        assert_eq!(config.autoscaler.hcloud_token, "from-env");

        // An explicit token wins over the environment.
        let config = load_str("autoscaler: { hcloud_token: explicit }\n").unwrap();
        assert_eq!(config.autoscaler.hcloud_token, "explicit");
        std::env::remove_var(HCLOUD_TOKEN_ENV);
    }

    #[test]
    fn test_env_tokens_in_procs_env() {
        std::env::set_var("CONFIG_TEST_REGION", "eu");
        let config = load_str(
            r#"
procs:
  env:
    REGION: "${env.CONFIG_TEST_REGION}"
    UNTOUCHED: "${not.a.known.token}"
"#,
        )
        .unwrap();

        assert_eq!(config.procs.env["REGION"], "eu");
        assert_eq!(config.procs.env["UNTOUCHED"], "${not.a.known.token}");
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Config::load("/nonexistent/scalegate.yml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
