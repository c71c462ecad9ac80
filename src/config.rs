use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Participant id this auth service is registered under at the ALS.
    pub participant_id: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboundConfig {
    /// Base URL for FSPIOP calls to peer participants (DFSPs / PISPs).
    pub peer_base_url: String,
    /// Base URL for the Account Lookup Service registry.
    pub als_base_url: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            peer_base_url: "http://localhost:4006".to_string(),
            als_base_url: "http://localhost:4002".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowConfig {
    /// How long to wait for the ALS reply during consent registration.
    pub register_timeout_seconds: u64,
    /// Credential ids that skip attestation verification entirely.
    ///
    /// SECURITY: demo/test credentials only. Every use is logged at WARN.
    /// MUST be empty in production deployments.
    pub demo_override_credential_ids: Vec<String>,
    /// Require user verification (UV flag) on attestations and assertions.
    pub require_user_verification: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            register_timeout_seconds: 40,
            demo_override_credential_ids: Vec::new(),
            require_user_verification: false,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}
