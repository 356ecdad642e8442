//! Operator configuration
//!
//! Every flag can also be supplied through the environment so the operator
//! runs unchanged from a Deployment manifest.

use std::time::Duration;

use clap::Parser;

use netfence_policy::BackendConfig;

/// netfence - SecurityPolicy operator for software-defined networking backends
#[derive(Parser, Debug, Clone)]
#[command(name = "netfence-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the SecurityPolicy CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Cluster name tagged onto every backend object
    #[arg(long, env = "NETFENCE_CLUSTER", default_value = "")]
    pub cluster: String,

    /// Backend policy domain
    #[arg(long, env = "NETFENCE_DOMAIN", default_value = "default")]
    pub domain: String,

    /// Backend manager URL
    #[arg(long, env = "NETFENCE_BACKEND_URL", default_value = "")]
    pub backend_url: String,

    /// Backend user
    #[arg(long, env = "NETFENCE_BACKEND_USER", default_value = "")]
    pub backend_user: String,

    /// Backend password
    #[arg(long, env = "NETFENCE_BACKEND_PASSWORD", default_value = "", hide_env_values = true)]
    pub backend_password: String,

    /// Skip verification of the backend's TLS certificate
    #[arg(long, env = "NETFENCE_INSECURE_SKIP_TLS_VERIFY")]
    pub insecure_skip_tls_verify: bool,

    /// Backend request timeout in seconds
    #[arg(long, env = "NETFENCE_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Seconds between garbage collection passes
    #[arg(long, env = "NETFENCE_GC_INTERVAL_SECS", default_value_t = 300)]
    pub gc_interval_secs: u64,
}

impl Cli {
    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster.is_empty() {
            return Err("--cluster (NETFENCE_CLUSTER) is required".to_string());
        }
        if self.backend_url.is_empty() {
            return Err("--backend-url (NETFENCE_BACKEND_URL) is required".to_string());
        }
        if self.gc_interval_secs == 0 {
            return Err("--gc-interval-secs must be positive".to_string());
        }
        Ok(())
    }

    /// Backend client settings
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.backend_url.clone(),
            username: self.backend_user.clone(),
            password: self.backend_password.clone(),
            cluster: self.cluster.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Interval between garbage collection passes
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}
