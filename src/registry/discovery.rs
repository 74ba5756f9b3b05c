//! Link discovery by scanning the kernel's view of network devices.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::HealthSnapshot;
use crate::types::{IfIndex, LinkKind, LinkState};
use crate::util::guess_link_kind;

/// Interface discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Automatically pick up interfaces as they appear.
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,

    /// How often to rescan for added or removed interfaces.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Interface names to skip. A trailing `*` matches a prefix.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

fn default_discovery_enabled() -> bool {
    true
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_ignore() -> Vec<String> {
    vec![
        "lo".into(),
        "docker*".into(),
        "virbr*".into(),
        "veth*".into(),
    ]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
            poll_interval: default_poll_interval(),
            ignore: default_ignore(),
        }
    }
}

impl DiscoveryConfig {
    /// Whether a named interface should be skipped.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|pat| match pat.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pat,
        })
    }
}

/// A link found during a scan, before registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub index: IfIndex,
    pub name: String,
    pub kind: LinkKind,
    /// Administratively up with carrier, as far as the kernel knows.
    pub oper_up: bool,
}

impl DiscoveredLink {
    /// State to register the link with. Links with carrier still start
    /// Degraded; only the prober can promote them to Up.
    pub fn initial_state(&self) -> LinkState {
        if self.oper_up {
            LinkState::Degraded
        } else {
            LinkState::Down
        }
    }
}

/// Scan `/sys/class/net` for candidate links.
#[cfg(target_os = "linux")]
pub fn scan_links(config: &DiscoveryConfig) -> std::io::Result<Vec<DiscoveredLink>> {
    scan_links_at(Path::new("/sys/class/net"), config)
}

#[cfg(not(target_os = "linux"))]
pub fn scan_links(_config: &DiscoveryConfig) -> std::io::Result<Vec<DiscoveredLink>> {
    Ok(vec![])
}

/// Same as [`scan_links`] with an explicit sysfs root, for tests.
#[cfg(target_os = "linux")]
fn scan_links_at(root: &Path, config: &DiscoveryConfig) -> std::io::Result<Vec<DiscoveredLink>> {
    let mut links = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if config.is_ignored(&name) {
            continue;
        }

        let path = entry.path();

        // Devices can vanish mid-scan; fall back to the OS lookup.
        let Some(index) = read_ifindex(&path).or_else(|| crate::util::if_nametoindex(&name))
        else {
            debug!(link = %name, "no interface index, skipping");
            continue;
        };

        let flags = read_flags(&path).unwrap_or(0);
        if flags & libc::IFF_LOOPBACK as u32 != 0 {
            continue;
        }

        // sysfs flags do not reliably carry IFF_RUNNING; operstate is the
        // supported carrier signal.
        let admin_up = flags & libc::IFF_UP as u32 != 0;
        let operstate = std::fs::read_to_string(path.join("operstate"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let oper_up = admin_up && operstate != "down";

        links.push(DiscoveredLink {
            index: IfIndex::new(index),
            name: name.clone(),
            kind: guess_link_kind(&name),
            oper_up,
        });
    }

    links.sort_by_key(|l| l.index);
    Ok(links)
}

#[cfg(target_os = "linux")]
fn read_ifindex(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path.join("ifindex"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn read_flags(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path.join("flags")).ok()?;
    let raw = raw.trim().trim_start_matches("0x");
    u32::from_str_radix(raw, 16).ok()
}

/// Compare a scan against the current snapshot: links to add, indices gone.
pub fn diff_links<'a>(
    scan: &'a [DiscoveredLink],
    snapshot: &HealthSnapshot,
) -> (Vec<&'a DiscoveredLink>, Vec<IfIndex>) {
    let added = scan
        .iter()
        .filter(|d| !snapshot.contains(d.index))
        .collect();
    let removed = snapshot
        .links
        .keys()
        .copied()
        .filter(|i| !scan.iter().any(|d| d.index == *i))
        .collect();
    (added, removed)
}
