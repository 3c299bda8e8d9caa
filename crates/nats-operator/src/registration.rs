//! CRD registration
//!
//! Installs (or updates) the NatsCluster CustomResourceDefinition and waits
//! until the API server reports it `Established`, so the controller's first
//! watch does not race the registration.

use crate::crd::{NatsCluster, GROUP};
use crate::error::{OperatorError, Result};
use crate::members::FIELD_MANAGER;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, CustomResourceExt};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the NatsCluster CRD object
pub fn crd_name() -> String {
    format!("natsclusters.{}", GROUP)
}

/// Render the CRD manifest as YAML
pub fn crd_yaml() -> Result<String> {
    Ok(serde_yaml::to_string(&NatsCluster::crd())?)
}

/// Apply the NatsCluster CRD and wait up to `timeout` for it to be established.
pub async fn ensure_crd(client: Client, timeout: Duration) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crd = NatsCluster::crd();
    let name = crd_name();

    debug!(name = %name, "Applying CustomResourceDefinition");
    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &patch_params, &Patch::Apply(&crd))
        .await
        .map_err(OperatorError::from)?;

    let established = await_condition(api, &name, conditions::is_crd_established());
    match tokio::time::timeout(timeout, established).await {
        Ok(Ok(_)) => {
            info!(name = %name, "CustomResourceDefinition established");
            Ok(())
        }
        Ok(Err(e)) => Err(OperatorError::Internal(format!(
            "waiting for CRD {}: {}",
            name, e
        ))),
        Err(_) => Err(OperatorError::Timeout(format!(
            "CRD {} not established within {:?}",
            name, timeout
        ))),
    }
}
