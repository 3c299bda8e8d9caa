//! NATS server configuration generation
//!
//! Renders the `nats.conf` document shared by every member of a cluster.
//! The output is a pure function of the cluster name and the member names:
//! members are sorted and deduplicated first, so the same set always yields
//! byte-identical output and the synchronizer can skip unchanged writes.

use crate::members::Member;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Key of the configuration document inside the artifact
pub const CONFIG_KEY: &str = "nats.conf";

/// Directory the artifact is mounted at inside each member
pub const CONFIG_MOUNT_PATH: &str = "/etc/nats-config";

/// Client connection port
pub const CLIENT_PORT: i32 = 4222;

/// Cluster route port
pub const CLUSTER_PORT: i32 = 6222;

/// HTTP monitoring port
pub const MONITORING_PORT: i32 = 8222;

/// Name of the headless service that gives members stable DNS names
pub fn management_service_name(cluster_name: &str) -> String {
    format!("{}-mgmt", cluster_name)
}

/// Route URL of one member, resolvable from any pod in the namespace
pub fn route_url(cluster_name: &str, member_name: &str) -> String {
    format!(
        "nats://{}.{}:{}",
        member_name,
        management_service_name(cluster_name),
        CLUSTER_PORT
    )
}

/// Generate the configuration document for `members` of `cluster_name`.
pub fn generate(cluster_name: &str, members: &[Member]) -> Vec<u8> {
    let names: BTreeSet<&str> = members.iter().map(|m| m.name.as_str()).collect();

    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = writeln!(out, "# nats.conf for cluster {}", cluster_name);
    let _ = writeln!(out, "# managed by nats-operator; manual edits are overwritten");
    let _ = writeln!(out, "port: {}", CLIENT_PORT);
    let _ = writeln!(out, "http_port: {}", MONITORING_PORT);
    let _ = writeln!(out);
    let _ = writeln!(out, "cluster {{");
    let _ = writeln!(out, "  port: {}", CLUSTER_PORT);
    if names.is_empty() {
        let _ = writeln!(out, "  routes = []");
    } else {
        let _ = writeln!(out, "  routes = [");
        for name in &names {
            let _ = writeln!(out, "    {}", route_url(cluster_name, name));
        }
        let _ = writeln!(out, "  ]");
    }
    let _ = writeln!(out, "}}");

    out.into_bytes()
}
