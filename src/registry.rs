//! The service registry: a process-wide map of `ServiceInfo` keyed by
//! service key, plus the CIDR-based admission check described in spec §4.5.

use std::net::IpAddr;

use dashmap::DashMap;
use ipnet::IpNet;
use rustc_hash::FxBuildHasher;

use crate::error::{Error, Result};

/// Identifies a named endpoint (spec §3, `ServiceInfo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub key: String,
    pub network: String,
    pub address: String,
    pub is_server: bool,
    pub reuse_port: bool,
    /// CIDR, possibly `;`-separated. Empty string admits every client.
    pub ip_range: String,
}

impl ServiceInfo {
    pub fn new(key: impl Into<String>, network: impl Into<String>, address: impl Into<String>) -> Self {
        ServiceInfo {
            key: key.into(),
            network: network.into(),
            address: address.into(),
            is_server: false,
            reuse_port: false,
            ip_range: String::new(),
        }
    }
}

/// The process-wide registry of [`ServiceInfo`] values. Mutation (insertion)
/// is effectively serialized by `DashMap`'s per-shard locking — duplicate keys
/// are rejected the same way the original `sync.Mutex`-guarded Go map rejects
/// them.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceInfo, FxBuildHasher>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry { services: DashMap::with_hasher(FxBuildHasher::default()) }
    }

    /// Inserts a new `ServiceInfo`. Fails if `info.key` is already registered.
    pub fn insert(&self, info: ServiceInfo) -> Result<()> {
        match self.services.entry(info.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::DuplicateService { key: info.key })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<ServiceInfo> {
        self.services.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }

    /// `IsClientIPInRange`: an empty range accepts all; a `;`-separated list
    /// of CIDRs admits the IP if any subnet contains it; a malformed CIDR
    /// anywhere in the list makes that subnet reject (never panics, never
    /// admits on a parse error).
    pub fn is_client_ip_in_range(&self, key: &str, ip: IpAddr) -> bool {
        let Some(info) = self.get(key) else {
            return false;
        };
        is_ip_in_range(&info.ip_range, ip)
    }
}

/// Standalone CIDR-admission check, split out of [`ServiceRegistry`] so the
/// framed listener/connector layer can reuse it without needing a full
/// registry lookup in tests.
pub fn is_ip_in_range(ip_range: &str, ip: IpAddr) -> bool {
    if ip_range.is_empty() {
        return true;
    }
    ip_range.split(';').map(str::trim).filter(|s| !s.is_empty()).any(|cidr| {
        cidr.parse::<IpNet>().map(|net| net.contains(&ip)).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_key() {
        let reg = ServiceRegistry::new();
        reg.insert(ServiceInfo::new("svc", "tcp", "127.0.0.1:0")).unwrap();
        let err = reg.insert(ServiceInfo::new("svc", "tcp", "127.0.0.1:1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateService { .. }));
    }

    #[test]
    fn empty_range_admits_all() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(is_ip_in_range("", ip));
    }

    #[test]
    fn single_cidr_admission() {
        let admitted: IpAddr = "10.1.2.3".parse().unwrap();
        let rejected: IpAddr = "172.16.0.1".parse().unwrap();
        assert!(is_ip_in_range("10.0.0.0/8", admitted));
        assert!(!is_ip_in_range("10.0.0.0/8", rejected));
    }

    #[test]
    fn multi_cidr_semicolon_list() {
        let range = "10.0.0.0/8;192.168.1.0/24";
        assert!(is_ip_in_range(range, "10.1.2.3".parse().unwrap()));
        assert!(is_ip_in_range(range, "192.168.1.50".parse().unwrap()));
        assert!(!is_ip_in_range(range, "172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn malformed_cidr_never_admits() {
        assert!(!is_ip_in_range("not-a-cidr", "10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn lookup_of_missing_service_rejects() {
        let reg = ServiceRegistry::new();
        assert!(!reg.is_client_ip_in_range("missing", "10.1.2.3".parse().unwrap()));
    }
}
