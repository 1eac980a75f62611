//! Text encodings for multi-valued fields.
//!
//! Ports are stored as comma-joined decimals (`80,443`); tag and
//! constraint maps as `key=value` pairs joined by commas.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

pub fn encode_ports(ports: &BTreeSet<u16>) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a port list, skipping entries that are not valid ports.
pub fn decode_ports(raw: &str) -> BTreeSet<u16> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                warn!(entry = s, "ignoring invalid port");
                None
            }
        })
        .collect()
}

pub fn encode_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `k=v,k=v`. Entries without `=` are skipped.
pub fn decode_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_encode_sorted() {
        let ports: BTreeSet<u16> = [443, 80].into_iter().collect();
        assert_eq!(encode_ports(&ports), "80,443");
        assert_eq!(encode_ports(&BTreeSet::new()), "");
    }

    #[test]
    fn ports_decode_skips_garbage() {
        let ports = decode_ports("80, 443,,abc,70000");
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![80, 443]);
        assert!(decode_ports("").is_empty());
    }

    #[test]
    fn pairs_parse_tag_lists() {
        let tags = decode_pairs("rack=r1, disk=ssd,broken,=x");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["rack"], "r1");
        assert_eq!(tags["disk"], "ssd");
        assert_eq!(encode_pairs(&tags), "disk=ssd,rack=r1");
    }
}
