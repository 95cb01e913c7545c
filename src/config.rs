use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::types::ControllerId;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub controller_id: ControllerId,
    pub controller_name: String,
    /// Gossip group shared by all controllers of one network.
    pub group: String,
    pub gossip_bind: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub cluster_secret: String,
    /// Upper bound on how long the loop waits for input between liveness
    /// checks.
    pub poll_interval_ms: u64,
    pub event_queue: usize,
    pub clear_rules_on_connect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_id: 0,
            controller_name: "spfmesh".into(),
            group: "SPF".into(),
            gossip_bind: SocketAddr::from(([0, 0, 0, 0], 5670)),
            peers: Vec::new(),
            cluster_secret: "default_insecure_secret".into(),
            poll_interval_ms: 3000,
            event_queue: 128,
            clear_rules_on_connect: true,
            snapshot_path: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
            .and_then(Self::with_secret_file)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("spfmesh.toml"))
            .merge(Json::file("spfmesh.json"))
            .merge(Env::prefixed("SPFMESH_"))
    }

    // Support Docker-style secrets
    fn with_secret_file(mut self) -> anyhow::Result<Self> {
        if let Ok(secret_file) = std::env::var("SPFMESH_CLUSTER_SECRET_FILE") {
            self.cluster_secret = std::fs::read_to_string(secret_file)?.trim().to_string();
        }
        Ok(self)
    }
}
