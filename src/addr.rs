//! Service URL grammar: `scheme://host-or-path[:port][?reuseport=<bool>]`.
//!
//! Ported from the `parseAddr` helper in the original `Network` package: the
//! scheme defaults to `tcp`, and the only recognized query option is
//! `reuseport`, whose truthy values are a leading digit 1-9 or `T`/`t`/`Y`/`y`.

use crate::error::{Error, Result};

pub const VALID_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6", "unix"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrOpts {
    pub reuse_port: bool,
}

/// Result of parsing a service URL: network scheme, bare address, and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub network: String,
    pub address: String,
    pub opts: AddrOpts,
}

/// Parses `scheme://address?k=v&...`, defaulting the scheme to `tcp` when no
/// `://` separator is present. Performs no socket-level validation: an
/// unrecognized scheme or a malformed address is only discovered when the
/// listener/connector actually tries to open it.
pub fn parse_addr(url: &str) -> ParsedAddr {
    let (network, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest.to_string()),
        None => ("tcp".to_string(), url.to_string()),
    };

    let mut opts = AddrOpts::default();
    let address = match rest.find('?') {
        Some(q) => {
            let (addr, query) = rest.split_at(q);
            let query = &query[1..];
            for part in query.split('&') {
                let mut kv = part.splitn(2, '=');
                let (Some(key), Some(val)) = (kv.next(), kv.next()) else {
                    continue;
                };
                if key == "reuseport" {
                    opts.reuse_port = is_truthy(val);
                }
            }
            addr.to_string()
        }
        None => rest,
    };

    ParsedAddr { network, address, opts }
}

/// Parses a service URL and rejects schemes `loomnet` doesn't recognize. Used
/// by [`crate::module::NetworkModule::listen`]/`connect`, which — unlike the
/// bare [`parse_addr`] helper above — must fail fast on nonsense input rather
/// than deferring to socket open time, since a bad scheme should never even
/// reach the service registry.
pub fn parse_service_url(url: &str) -> Result<ParsedAddr> {
    let parsed = parse_addr(url);
    if !VALID_NETWORKS.contains(&parsed.network.as_str()) {
        return Err(Error::InvalidAddress {
            url: url.to_string(),
            reason: format!("unrecognized network scheme {:?}", parsed.network),
        });
    }
    Ok(parsed)
}

fn is_truthy(val: &str) -> bool {
    match val.as_bytes().first() {
        None => false,
        Some(b'T' | b't' | b'Y' | b'y') => true,
        Some(&b) => b.is_ascii_digit() && b != b'0',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scheme_to_tcp() {
        let parsed = parse_addr("localhost:5000");
        assert_eq!(parsed.network, "tcp");
        assert_eq!(parsed.address, "localhost:5000");
        assert!(!parsed.opts.reuse_port);
    }

    #[test]
    fn splits_scheme_and_address() {
        let parsed = parse_addr("udp://0.0.0.0:9000");
        assert_eq!(parsed.network, "udp");
        assert_eq!(parsed.address, "0.0.0.0:9000");
    }

    #[test]
    fn parses_reuseport_digit() {
        let parsed = parse_addr("tcp://localhost:5000?reuseport=1");
        assert!(parsed.opts.reuse_port);
    }

    #[test]
    fn parses_reuseport_letters() {
        for v in ["T", "t", "Y", "y"] {
            let parsed = parse_addr(&format!("tcp://localhost:5000?reuseport={v}"));
            assert!(parsed.opts.reuse_port, "expected {v} to be truthy");
        }
    }

    #[test]
    fn zero_digit_is_falsy() {
        let parsed = parse_addr("tcp://localhost:5000?reuseport=0");
        assert!(!parsed.opts.reuse_port);
    }

    #[test]
    fn unrecognized_query_key_is_ignored() {
        let parsed = parse_addr("tcp://localhost:5000?foo=bar&reuseport=1");
        assert!(parsed.opts.reuse_port);
        assert_eq!(parsed.address, "localhost:5000");
    }

    #[test]
    fn unix_socket_path() {
        let parsed = parse_addr("unix:///tmp/loomnet.sock");
        assert_eq!(parsed.network, "unix");
        assert_eq!(parsed.address, "/tmp/loomnet.sock");
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = parse_service_url("quic://localhost:5000").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }
}
