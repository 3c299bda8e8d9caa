//! Kubernetes Resource Builders
//!
//! This module generates the Kubernetes manifests (member Pods, the headless
//! management Service and the configuration Secret) for a NatsCluster.

use crate::artifact::Artifact;
use crate::crd::{selector_labels, ClusterDesiredState, ClusterKey, GROUP, KIND, VERSION};
use crate::error::{OperatorError, Result};
use crate::members::MemberSpec;
use crate::natsconf::{
    management_service_name, CLIENT_PORT, CLUSTER_PORT, CONFIG_KEY, CONFIG_MOUNT_PATH,
    MONITORING_PORT,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, HTTPGetAction, Pod, PodSpec, Probe, SeccompProfile,
    Secret, SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// Owner reference pointing at a NatsCluster
pub fn owner_reference(cluster_name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", GROUP, VERSION),
        kind: KIND.to_string(),
        name: cluster_name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn owner_references(cluster_name: &str, uid: Option<&str>) -> Option<Vec<OwnerReference>> {
    uid.map(|uid| vec![owner_reference(cluster_name, uid)])
}

/// Builder for generating Kubernetes resources from a NatsCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a ClusterDesiredState,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a ClusterDesiredState) -> Result<Self> {
        if cluster.key.name.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "cluster name is required".to_string(),
            ));
        }
        Ok(Self { cluster })
    }

    fn key(&self) -> &ClusterKey {
        &self.cluster.key
    }

    fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        owner_references(&self.key().name, self.cluster.uid.as_deref())
    }

    /// Build the Pod for one cluster member
    pub fn build_member_pod(&self, member: &MemberSpec) -> Pod {
        let spec = &self.cluster.spec;
        let labels = spec.get_labels(&self.key().name);

        let pod_spec = PodSpec {
            hostname: Some(member.name.clone()),
            subdomain: Some(management_service_name(&self.key().name)),
            containers: vec![self.build_container()],
            volumes: Some(vec![Volume {
                name: "config".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.key().name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            // Members are replaced, never restarted in place
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(member.name.clone()),
                namespace: Some(self.key().namespace.clone()),
                labels: Some(labels),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(pod_spec),
            ..Default::default()
        }
    }

    /// Build the NATS server container
    fn build_container(&self) -> Container {
        let spec = &self.cluster.spec;

        let ports = vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: CLIENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("cluster".to_string()),
                container_port: CLUSTER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("monitoring".to_string()),
                container_port: MONITORING_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ];

        let probe = |initial_delay: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/varz".to_string()),
                port: IntOrString::Int(MONITORING_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            ..Default::default()
        };

        Container {
            name: "nats".to_string(),
            image: Some(spec.get_image()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec![
                "--config".to_string(),
                format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
            ]),
            ports: Some(ports),
            liveness_probe: Some(probe(10)),
            readiness_probe: Some(probe(2)),
            volume_mounts: Some(vec![VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the headless service that gives every member a stable DNS name
    pub fn build_management_service(&self) -> Service {
        let spec = &self.cluster.spec;
        let labels = spec.get_labels(&self.key().name);

        Service {
            metadata: ObjectMeta {
                name: Some(management_service_name(&self.key().name)),
                namespace: Some(self.key().namespace.clone()),
                labels: Some(labels),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(spec.get_selector_labels(&self.key().name)),
                ports: Some(vec![
                    ServicePort {
                        name: Some("cluster".to_string()),
                        port: CLUSTER_PORT,
                        target_port: Some(IntOrString::Int(CLUSTER_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("monitoring".to_string()),
                        port: MONITORING_PORT,
                        target_port: Some(IntOrString::Int(MONITORING_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Build the Secret holding a configuration artifact.
///
/// The Secret carries exactly the artifact's data; anything else a previous
/// writer put there is dropped when this object replaces it.
pub fn build_artifact_secret(artifact: &Artifact) -> Secret {
    let data: BTreeMap<String, ByteString> = artifact
        .data
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect();

    let mut labels = selector_labels(&artifact.key.name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "nats-operator".to_string(),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(artifact.key.name.clone()),
            namespace: Some(artifact.key.namespace.clone()),
            labels: Some(labels),
            owner_references: owner_references(&artifact.key.name, artifact.owner_uid.as_deref()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}
