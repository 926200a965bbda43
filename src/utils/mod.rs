//! Utility modules for the engine

pub mod address_exclusions;
pub mod target_parser;
pub mod timing;

use crate::error::EngineError;
use crate::Result;
use address_exclusions::AddressExclusions;
use std::collections::BTreeSet;
use std::net::IpAddr;
use target_parser::TargetParser;

/// Expand target specs, subtract exclusions, and return a sorted, deduplicated host list.
///
/// Exclusions are applied after full expansion and match exact host values.
pub fn resolve_targets<S: AsRef<str>>(
    targets: &[S],
    excludes: &[S],
    parser: &TargetParser,
) -> Result<Vec<IpAddr>> {
    let exclusions = AddressExclusions::from_specs(excludes)?;

    let mut resolved = BTreeSet::new();
    for spec in targets {
        let parsed = parser.parse_target(spec.as_ref())?;
        log::debug!(
            "target '{}' ({:?}) expanded to {} addresses",
            parsed.original,
            parsed.target_type,
            parsed.addresses.len()
        );
        resolved.extend(parsed.addresses);
    }

    let hosts = exclusions.filter_addresses(resolved);
    if hosts.is_empty() {
        return Err(EngineError::EmptyTargetSet);
    }

    Ok(hosts)
}
