use serde::Deserialize;

/// Controller configuration (§6 "Control configuration").
///
/// Loaded the way `jarvis-core` layers its own settings: a TOML file
/// overlaid with `COSMOS_`-prefixed environment variables, via the
/// `config` crate.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    pub database_url: String,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    #[serde(default)]
    pub tls_client_ca_path: Option<String>,

    #[serde(default)]
    pub node_directory_url: Option<String>,

    #[serde(default)]
    pub external_bulk_dispatcher_url: Option<String>,
    #[serde(default)]
    pub external_orchestrator_url: Option<String>,

    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: i64,
    #[serde(default = "default_offline_sweep_interval_secs")]
    pub offline_sweep_interval_secs: u64,
    #[serde(default = "default_node_sync_interval_secs")]
    pub node_sync_interval_secs: u64,
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
    #[serde(default = "default_retention_cutoff_days")]
    pub retention_cutoff_days: i64,
}

fn default_http_port() -> u16 {
    8090
}
fn default_stream_port() -> u16 {
    9091
}
fn default_offline_after_secs() -> i64 {
    120
}
fn default_offline_sweep_interval_secs() -> u64 {
    60
}
fn default_node_sync_interval_secs() -> u64 {
    300
}
fn default_retention_interval_secs() -> u64 {
    86_400
}
fn default_retention_cutoff_days() -> i64 {
    30
}

impl ControllerConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("http_port", default_http_port() as i64)?
            .set_default("stream_port", default_stream_port() as i64)?
            .set_default("offline_after_secs", default_offline_after_secs())?
            .set_default("offline_sweep_interval_secs", default_offline_sweep_interval_secs() as i64)?
            .set_default("node_sync_interval_secs", default_node_sync_interval_secs() as i64)?
            .set_default("retention_interval_secs", default_retention_interval_secs() as i64)?
            .set_default("retention_cutoff_days", default_retention_cutoff_days())?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("COSMOS").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
