//! Typed facade over the container daemon. Only the operations the
//! lifecycle and the pruner need; domain logic stays in
//! [`crate::instances`].

use std::collections::HashMap;

use bollard::{
    Docker,
    errors::Error as BollardError,
    models::{ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, Network},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        InspectNetworkOptions, ListContainersOptionsBuilder, ListNetworksOptionsBuilder,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
    secret::{
        ContainerCreateBody, NetworkConnectRequest, NetworkCreateRequest, NetworkDisconnectRequest,
    },
};
use futures_util::StreamExt;
use log::info;

pub type Filters = HashMap<String, Vec<String>>;

#[derive(Clone)]
pub struct DockerClient {
    client: Docker,
}

impl DockerClient {
    /// Connects to the daemon configured by the environment (`DOCKER_HOST`
    /// or the local socket). The connection itself is established lazily.
    pub fn connect() -> Result<Self, BollardError> {
        Ok(Self {
            client: Docker::connect_with_defaults()?,
        })
    }

    pub async fn list_containers(
        &self,
        filters: &Filters,
        all: bool,
        limit: Option<i32>,
    ) -> Result<Vec<ContainerSummary>, BollardError> {
        let mut options = ListContainersOptionsBuilder::new().all(all).filters(filters);
        if let Some(limit) = limit {
            options = options.limit(limit);
        }
        self.client.list_containers(Some(options.build())).await
    }

    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspectResponse, BollardError> {
        self.client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
    }

    pub async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<ContainerCreateResponse, BollardError> {
        self.client
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                body,
            )
            .await
    }

    pub async fn start_container(&self, name: &str) -> Result<(), BollardError> {
        self.client
            .start_container(name, None::<StartContainerOptions>)
            .await
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: i32) -> Result<(), BollardError> {
        self.client
            .stop_container(
                id,
                Some(StopContainerOptionsBuilder::new().t(timeout_secs).build()),
            )
            .await
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), BollardError> {
        self.client
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .v(true)
                        .force(true)
                        .build(),
                ),
            )
            .await
    }

    /// Makes sure `image` exists locally, pulling it when the daemon does
    /// not know it yet.
    pub async fn ensure_image(&self, image: &str) -> Result<(), BollardError> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut pull = self.client.create_image(Some(options), None, None);
        while let Some(step) = pull.next().await {
            let step = step?;
            if let Some(status) = &step.status {
                info!("Pulling {image}: {status}");
            }
        }
        Ok(())
    }

    pub async fn inspect_network(&self, name: &str) -> Result<Network, BollardError> {
        self.client
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
    }

    pub async fn create_network(&self, request: NetworkCreateRequest) -> Result<(), BollardError> {
        self.client.create_network(request).await?;
        Ok(())
    }

    pub async fn list_networks(&self, filters: &Filters) -> Result<Vec<Network>, BollardError> {
        self.client
            .list_networks(Some(ListNetworksOptionsBuilder::new().filters(filters).build()))
            .await
    }

    pub async fn connect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), BollardError> {
        self.client
            .connect_network(
                network,
                NetworkConnectRequest {
                    container: Some(container.to_owned()),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<(), BollardError> {
        self.client
            .disconnect_network(
                network,
                NetworkDisconnectRequest {
                    container: Some(container.to_owned()),
                    force: Some(force),
                },
            )
            .await
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), BollardError> {
        self.client.remove_network(name).await
    }
}

/// The daemon reported 404 for the addressed resource.
pub fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// The daemon reported 409, e.g. connecting a container that is already
/// attached.
pub fn is_conflict(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

/// The daemon ran out of free subnets while creating a network.
pub fn is_pool_exhausted(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 400,
            message,
        } if message.contains("fully subnetted")
    )
}
