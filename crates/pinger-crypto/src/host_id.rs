use anyhow::{Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Where Linux exposes network interfaces and their hardware addresses.
pub const SYSFS_NET: &str = "/sys/class/net";

const HOST_ID_FILE: &str = "host_id";

/// Derive this host's identifier: lowercase hex SHA-256 of the first
/// non-loopback interface MAC address.
///
/// Falls back to a random identifier persisted under `state_dir`, so a host
/// without readable interfaces keeps the same id across restarts.
pub fn load_or_create_host_id(state_dir: &Path) -> Result<String> {
    if let Some(id) = host_id_from_interfaces(Path::new(SYSFS_NET)) {
        return Ok(id);
    }

    let path = state_dir.join(HOST_ID_FILE);
    if path.exists() {
        let id = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let id = hex::encode(Sha256::digest(bytes));
    std::fs::write(&path, &id).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::warn!(path = %path.display(), "no hardware address found, generated host id");
    Ok(id)
}

/// Scan a sysfs-style directory (`<root>/<iface>/address`) in name order and
/// hash the first usable hardware address.
pub fn host_id_from_interfaces(root: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    names
        .iter()
        .filter(|name| !name.starts_with("lo"))
        .filter_map(|name| std::fs::read_to_string(root.join(name).join("address")).ok())
        .filter_map(|addr| parse_mac(addr.trim()))
        .find(|mac| mac.iter().any(|b| *b != 0))
        .map(|mac| hex::encode(Sha256::digest(&mac)))
}

/// Parse `aa:bb:cc:dd:ee:ff` into raw bytes.
fn parse_mac(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() {
        return None;
    }
    s.split(':')
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect()
}
