//! Docker implementation of the container-host contract, via bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HealthStatusEnum};
use bollard::network::{ConnectNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{error, info};

use opless_core::Lambda;

use crate::host::{ContainerHost, ContainerInfo, HostError, HostResult, ManagedContainer};

/// Label key applied to every managed image and container; the value is the
/// deployment id.
const DEPLOYMENT_LABEL: &str = "opless";

/// Cap on cleanup work after a failed container create.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Container host backed by the local Docker daemon.
pub struct DockerHost {
    docker: Docker,
    deployment_id: String,
    internal_network: String,
}

impl DockerHost {
    pub fn connect(deployment_id: String, internal_network: String) -> HostResult<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| HostError::Api(e.to_string()))?;
        Ok(Self {
            docker,
            deployment_id,
            internal_network,
        })
    }

    fn label(&self) -> String {
        format!("{DEPLOYMENT_LABEL}={}", self.deployment_id)
    }

    fn labels(&self) -> HashMap<String, String> {
        HashMap::from([(DEPLOYMENT_LABEL.to_string(), self.deployment_id.clone())])
    }

    /// Remove a container that was created but could not be fully wired up.
    async fn rollback_container(&self, container_id: &str) {
        let remove = self.docker.remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        match tokio::time::timeout(ROLLBACK_TIMEOUT, remove).await {
            Ok(Ok(())) => info!(container_id, "rolled back container"),
            Ok(Err(e)) => error!(container_id, error = %e, "failed to roll back container"),
            Err(_) => error!(container_id, "container rollback timed out"),
        }
    }
}

#[async_trait]
impl ContainerHost for DockerHost {
    async fn create(&self, lambda: &Lambda, context: Bytes) -> HostResult<String> {
        let docker = lambda.docker.as_ref().ok_or(HostError::Incomplete)?;
        let image = docker.image.clone().ok_or(HostError::Incomplete)?;
        if docker.container.is_none() {
            return Err(HostError::Incomplete);
        }

        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters: HashMap::from([("label".to_string(), vec![self.label()])]),
                ..Default::default()
            }))
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;
        let exists = images.iter().any(|summary| {
            summary
                .repo_tags
                .first()
                .is_some_and(|tag| tag.split(':').next() == Some(image.as_str()))
        });
        if exists {
            return Err(HostError::ImageExists(image));
        }

        let options = BuildImageOptions {
            t: image.clone(),
            labels: self.labels(),
            rm: true,
            ..Default::default()
        };
        let mut build = self
            .docker
            .build_image(options, None, Some(context));

        let mut build_errors = String::new();
        while let Some(progress) = build.next().await {
            let info = progress.map_err(|e| HostError::Build(e.to_string()))?;
            if let Some(message) = info.error {
                build_errors.push_str(&message);
            }
        }
        if !build_errors.is_empty() {
            return Err(HostError::Build(build_errors));
        }

        info!(image = %image, lambda = %lambda.id, "image built");
        self.create_container(lambda).await
    }

    async fn create_container(&self, lambda: &Lambda) -> HostResult<String> {
        let docker = lambda.docker.as_ref().ok_or(HostError::Incomplete)?;
        let image = docker.image.clone().ok_or(HostError::Incomplete)?;
        let name = docker.container.clone().ok_or(HostError::Incomplete)?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(image),
                    labels: Some(self.labels()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        if let Err(e) = self.attach_network(lambda, &created.id).await {
            self.rollback_container(&created.id).await;
            return Err(e);
        }

        info!(container_id = %created.id, lambda = %lambda.id, "container created");
        Ok(created.id)
    }

    async fn start(&self, lambda: &Lambda) -> HostResult<()> {
        let id = lambda.container_id().ok_or(HostError::Incomplete)?;

        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;
        let state = info.state.unwrap_or_default();
        if state.running.unwrap_or(false) || state.restarting.unwrap_or(false) {
            return Ok(());
        }

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))
    }

    async fn stop(&self, lambda: &Lambda) -> HostResult<()> {
        let id = lambda.container_id().ok_or(HostError::Incomplete)?;

        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;
        let state = info.state.unwrap_or_default();
        if !state.running.unwrap_or(false) && !state.restarting.unwrap_or(false) {
            return Ok(());
        }

        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))
    }

    async fn remove(&self, lambda: &Lambda) -> HostResult<()> {
        let docker = lambda.docker.as_ref().ok_or(HostError::Incomplete)?;
        let image = docker.image.clone().ok_or(HostError::Incomplete)?;
        let id = docker.container_id.clone().ok_or(HostError::Incomplete)?;

        self.stop(lambda).await?;

        self.docker
            .remove_container(&id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        self.docker
            .remove_image(&image, None::<RemoveImageOptions>, None)
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        info!(container_id = %id, image = %image, lambda = %lambda.id, "container removed");
        Ok(())
    }

    async fn inspect(&self, id: &str) -> HostResult<ContainerInfo> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        let state = info.state.unwrap_or_default();
        let health = state
            .health
            .and_then(|h| h.status)
            .map(health_label)
            .unwrap_or("none")
            .to_string();

        Ok(ContainerInfo {
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            health,
        })
    }

    async fn list(&self) -> HostResult<Vec<ManagedContainer>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: HashMap::from([("label".to_string(), vec![self.label()])]),
                ..Default::default()
            }))
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        Ok(containers
            .into_iter()
            .map(|c| ManagedContainer {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
            })
            .collect())
    }
}

impl DockerHost {
    /// Attach a freshly created container to the internal network with an
    /// alias equal to the lambda name.
    async fn attach_network(&self, lambda: &Lambda, container_id: &str) -> HostResult<()> {
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: HashMap::from([(
                    "name".to_string(),
                    vec![self.internal_network.clone()],
                )]),
            }))
            .await
            .map_err(|e| HostError::Api(e.to_string()))?;

        if networks.len() != 1 {
            return Err(HostError::Network(format!(
                "expected exactly one network named '{}', found {}",
                self.internal_network,
                networks.len()
            )));
        }
        let network_id = networks[0]
            .id
            .clone()
            .ok_or_else(|| HostError::Network("network has no id".to_string()))?;

        self.docker
            .connect_network(
                &network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![lambda.name.clone()]),
                        ..Default::default()
                    },
                },
            )
            .await
            .map_err(|e| HostError::Network(e.to_string()))
    }
}

fn health_label(status: HealthStatusEnum) -> &'static str {
    match status {
        HealthStatusEnum::STARTING => "starting",
        HealthStatusEnum::HEALTHY => "healthy",
        HealthStatusEnum::UNHEALTHY => "unhealthy",
        HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => "none",
    }
}
