//! CNI network configuration for Firecracker VMs

use serde_json::{Value, json};
use std::io;
use std::path::{Path, PathBuf};

/// File name of the conflist; it must be the only file in its directory
pub const CNI_CONFLIST: &str = "10-kiln-cni.conflist";

/// Bandwidth-shaping plugin, or `None` when both rates are unlimited (0)
///
/// Bursts are twice the rate in each direction.
pub fn bandwidth_plugin(ingress_rate: u64, egress_rate: u64) -> Option<Value> {
    if ingress_rate == 0 && egress_rate == 0 {
        return None;
    }

    Some(json!({
        "type": "bandwidth",
        "ingressRate": ingress_rate,
        "ingressBurst": ingress_rate.saturating_mul(2),
        "egressRate": egress_rate,
        "egressBurst": egress_rate.saturating_mul(2),
    }))
}

/// Full conflist: bridge, portmap, firewall, isolation and bandwidth
pub fn cni_conflist(subnet: &str, ingress_rate: u64, egress_rate: u64) -> Value {
    let mut plugins = vec![
        json!({
            "type": "bridge",
            "bridge": "kiln0",
            "isGateway": true,
            "isDefaultGateway": true,
            "promiscMode": false,
            "ipMasq": true,
            "ipam": {
                "type": "host-local",
                "subnet": subnet,
            },
        }),
        json!({
            "type": "portmap",
            "capabilities": { "portMappings": true },
        }),
        json!({ "type": "firewall" }),
        json!({ "type": "isolation" }),
    ];
    plugins.extend(bandwidth_plugin(ingress_rate, egress_rate));

    json!({
        "cniVersion": "0.4.0",
        "name": "kiln-cni",
        "plugins": plugins,
    })
}

/// Writes the conflist alone into `<parent>/cni`
///
/// # Returns
/// The CNI directory, for `CNI_CONF_DIR`
pub fn write_cni_config(
    parent: &Path,
    subnet: &str,
    ingress_rate: u64,
    egress_rate: u64,
) -> io::Result<PathBuf> {
    let dir = parent.join("cni");
    std::fs::create_dir_all(&dir)?;

    let conflist = cni_conflist(subnet, ingress_rate, egress_rate);
    std::fs::write(dir.join(CNI_CONFLIST), serde_json::to_vec_pretty(&conflist)?)?;

    Ok(dir)
}
