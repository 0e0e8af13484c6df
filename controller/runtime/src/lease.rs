use crate::k8s::{self, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "gantry-controller";

/// Ensures the status lease exists and starts competing for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    lease_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The Lease is owned by the controller's Deployment, when there is one,
    // so that it is removed along with the controller.
    let owner = match k8s::Api::<Deployment>::namespaced(runtime.client(), ns)
        .get_opt(deployment_name)
        .await?
    {
        Some(deployment) => deployment.controller_owner_ref(&()),
        None => {
            tracing::debug!(deployment = %deployment_name, "Controller deployment not found");
            None
        }
    };

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: owner.map(|o| vec![o]),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    "gateway-controller".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            lease_name,
            &k8s::PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &k8s::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
