use std::collections::BTreeSet;

use serde::Deserialize;

/// Agent configuration (§6 "Control configuration").
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// `host:port` of the controller's stream server.
    pub controller_url: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub tls_ca_path: Option<String>,
    #[serde(default)]
    pub tls_client_cert_path: Option<String>,
    #[serde(default)]
    pub tls_client_key_path: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_data_dir() -> String {
    "./cosmos-agent-data".to_string()
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_reconcile_interval_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl AgentConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("data_dir", default_data_dir())?
            .set_default("reconnect_interval_secs", default_reconnect_interval_secs())?
            .set_default("reconcile_interval_secs", default_reconcile_interval_secs())?
            .set_default("heartbeat_interval_secs", default_heartbeat_interval_secs())?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("COSMOS_AGENT").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn resolved_hostname(&self) -> anyhow::Result<String> {
        match &self.hostname {
            Some(h) => Ok(h.clone()),
            None => Ok(hostname::get()?.to_string_lossy().to_string()),
        }
    }

    pub fn programs_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("programs")
    }

    pub fn scripts_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("scripts")
    }

    pub fn logs_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("logs")
    }

    pub fn db_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("agent.db")
    }
}
