//! Demo-only service configuration: a JSON file describing the services a
//! binary wants to `listen`/`connect` at startup. Never touched by the core
//! runtime itself — `NetworkModule` only ever takes `ServiceInfo` values or
//! URL strings directly.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::registry::ServiceInfo;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceFileConfig {
    pub key: String,
    pub network: String,
    pub address: String,
    #[serde(default)]
    pub is_server: bool,
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default)]
    pub ip_range: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub services: Vec<ServiceFileConfig>,
}

/// Reads and parses a JSON service config file, returning the
/// [`ServiceInfo`] values ready to hand to [`crate::module::NetworkModule`]
/// one by one.
pub fn load_services(path: impl AsRef<Path>) -> Result<Vec<ServiceInfo>> {
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: ServiceConfig = serde_json::from_str(&raw).map_err(|err| {
        Error::InvalidAddress { url: String::new(), reason: format!("malformed service config: {err}") }
    })?;

    Ok(config
        .services
        .into_iter()
        .map(|svc| ServiceInfo {
            key: svc.key,
            network: svc.network,
            address: svc.address,
            is_server: svc.is_server,
            reuse_port: svc.reuse_port,
            ip_range: svc.ip_range,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_service_list() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("loomnet-config-test-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"services":[{"key":"echo","network":"tcp","address":"127.0.0.1:9000","is_server":true}]}"#,
        )
        .unwrap();

        let services = load_services(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(services.len(), 1);
        assert_eq!(services[0].key, "echo");
        assert!(services[0].is_server);
        assert!(!services[0].reuse_port);
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("loomnet-config-bad-{}.json", std::process::id()));
        std::fs::write(&path, "not json").unwrap();

        let err = load_services(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }
}
