//! Server configuration
//!
//! Everything has a default matching the fixed port table the server has
//! always used; a TOML file passed as the first argument can override it.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the public listeners bind to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Plain-HTTP ports in preference order; the next is tried only when
    /// the previous one fails to bind.
    #[serde(default = "default_http_ports")]
    pub http_ports: Vec<u16>,

    /// TLS ports in preference order.
    #[serde(default = "default_tls_ports")]
    pub tls_ports: Vec<u16>,

    /// Admin upload port on loopback. No fallback.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// ACME persistence file in the server's working directory.
    #[serde(default = "default_acme_cache")]
    pub acme_cache: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_ports: default_http_ports(),
            tls_ports: default_tls_ports(),
            admin_port: default_admin_port(),
            acme_cache: default_acme_cache(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_http_ports() -> Vec<u16> {
    vec![80, 8000]
}

fn default_tls_ports() -> Vec<u16> {
    vec![443, 4443]
}

fn default_admin_port() -> u16 {
    8888
}

fn default_acme_cache() -> String {
    "letsencrypt.cache".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&contents)?)
    }
}
