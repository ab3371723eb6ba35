//! Background reclamation of expired instances. Runs as its own
//! cooperative loop with its own daemon client, scans managed resources by
//! label, and funnels expired instances through the regular stop path.

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::timestamp,
    config::State,
    docker::{self, DockerClient},
    error::Result,
    instances, labels,
};

pub async fn run(state: State, shutdown: CancellationToken) {
    // The pruner constructs its own client inside its own scheduling
    // context; it never shares the request handlers' client.
    let docker = match DockerClient::connect() {
        Ok(docker) => docker,
        Err(err) => {
            error!("Pruner could not construct a docker client: {err}");
            return;
        }
    };

    let interval = std::time::Duration::from_secs(state.config.prunner_interval_seconds);
    loop {
        info!("Running instance pruner");
        let now = timestamp();
        if let Err(err) = prune_instances(&state, &docker, now).await {
            error!("Encountered an error while pruning instances: {err}");
        }
        if let Err(err) = prune_networks(&state, &docker, now).await {
            error!("Encountered an error while pruning networks: {err}");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn prune_instances(state: &State, docker: &DockerClient, now: i64) -> Result<()> {
    let filters = instances::manager_filters(&state.config);
    let containers = docker.list_containers(&filters, true, None).await?;

    for container in containers {
        let Some(id) = container.id.as_deref() else {
            continue;
        };

        let details = match docker.inspect_container(id).await {
            Ok(details) => details,
            // got deleted already
            Err(err) if docker::is_not_found(&err) => continue,
            Err(err) => {
                warn!("Pruner failed to inspect container {id}: {err}");
                continue;
            }
        };

        let container_labels = details.config.and_then(|c| c.labels).unwrap_or_default();
        let Some(expires_at) = container_labels
            .get(labels::EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok())
        else {
            warn!("Pruner skipping container {id} without a readable expiry label");
            continue;
        };
        if expires_at > now {
            continue;
        }

        let (Some(challenge), Some(team_id)) = (
            container_labels.get(labels::CHALLENGE),
            container_labels.get(labels::TEAM_ID),
        ) else {
            warn!("Pruner skipping container {id} without challenge/team labels");
            continue;
        };

        info!(
            "Pruner stopping expired container {id} challenge={challenge} team={team_id} \
             expires_at={expires_at} now={now}"
        );
        if let Err(err) = instances::stop_instance(state, challenge, team_id).await {
            warn!("Pruner failed to stop expired container {id}, will try again: {err}");
        }
    }

    Ok(())
}

async fn prune_networks(state: &State, docker: &DockerClient, now: i64) -> Result<()> {
    let filters = instances::manager_filters(&state.config);
    let networks = docker.list_networks(&filters).await?;

    let mut names_to_prune = Vec::new();
    for network in networks {
        let Some(name) = network.name else {
            continue;
        };

        // List responses omit labels on some daemon versions; an explicit
        // inspect per network is the only reliable way to read the expiry.
        let details = match docker.inspect_network(&name).await {
            Ok(details) => details,
            Err(err) if docker::is_not_found(&err) => continue,
            Err(err) => {
                warn!("Pruner failed to inspect network {name}: {err}");
                continue;
            }
        };

        let Some(expires_at) = details
            .labels
            .unwrap_or_default()
            .get(labels::EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok())
        else {
            continue;
        };
        if expires_at > now {
            continue;
        }

        info!("Pruning expired network {name} expires_at={expires_at} now={now}");
        names_to_prune.push(name);
    }

    instances::cleanup_networks(docker, &names_to_prune).await;
    Ok(())
}
