//! Instance lifecycle: start/stop/status for a (challenge, team) pair plus
//! the shared teardown helpers the pruner reuses.
//!
//! There is no instance registry. The containers and networks created
//! here carry the managed label set, and label read-back against the
//! daemon is the canonical "does it exist" test.

use std::collections::{HashMap, HashSet};

use bollard::{
    models::{ContainerStateStatusEnum, ContainerSummary},
    secret::{
        ContainerCreateBody, EndpointSettings, HostConfig, HostConfigLogConfig,
        NetworkCreateRequest, NetworkingConfig, ResourcesUlimits, RestartPolicy,
        RestartPolicyNameEnum,
    },
};
use futures_util::future::{join_all, try_join_all};
use log::{error, info, warn};
use nanoid::nanoid;
use serde::Serialize;
use warden_common::challenge::{Challenge, Container, ExposeKind};

use crate::{
    clock::timestamp,
    config::{Config, State},
    docker::{self, DockerClient, Filters},
    error::{Error, Result},
    labels,
};

const INSTANCE_ID_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Starting,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub kind: ExposeKind,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub status: InstanceStatus,
    pub timeout: u64,
    pub endpoints: Option<Vec<Endpoint>>,
    pub remaining_time: Option<i64>,
}

pub fn container_name(
    config: &Config,
    challenge_name: &str,
    team_id: &str,
    container: &str,
) -> String {
    format!("{}-{}-{}-{}", config.prefix, challenge_name, team_id, container)
}

pub fn service_network_name(
    config: &Config,
    challenge_name: &str,
    team_id: &str,
    instance_id: &str,
) -> String {
    format!(
        "{}-svc-{}-{}-{}",
        config.prefix, challenge_name, team_id, instance_id
    )
}

pub fn egress_network_name(
    config: &Config,
    challenge_name: &str,
    team_id: &str,
    instance_id: &str,
) -> String {
    format!(
        "{}-eg-{}-{}-{}",
        config.prefix, challenge_name, team_id, instance_id
    )
}

pub fn instance_host(config: &Config, challenge_name: &str, instance_id: &str) -> String {
    format!("{}-{}.{}", challenge_name, instance_id, config.instances_host)
}

fn search_filters(config: &Config, challenge_name: &str, team_id: &str) -> Filters {
    HashMap::from([(
        "label".to_owned(),
        vec![
            format!("{}={}", labels::MANAGED_BY, config.docker_manager_name),
            format!("{}={}", labels::CHALLENGE, challenge_name),
            format!("{}={}", labels::TEAM_ID, team_id),
        ],
    )])
}

/// Filter matching every managed resource regardless of key; the pruner's
/// discovery query.
pub fn manager_filters(config: &Config) -> Filters {
    HashMap::from([(
        "label".to_owned(),
        vec![format!(
            "{}={}",
            labels::MANAGED_BY,
            config.docker_manager_name
        )],
    )])
}

async fn get_containers(
    state: &State,
    challenge_name: &str,
    team_id: &str,
    running_only: bool,
    limit: Option<i32>,
) -> Vec<ContainerSummary> {
    let filters = search_filters(&state.config, challenge_name, team_id);
    match state
        .docker
        .list_containers(&filters, !running_only, limit)
        .await
    {
        Ok(containers) => containers,
        Err(err) => {
            error!("Error getting containers: challenge={challenge_name} team={team_id}: {err}");
            vec![]
        }
    }
}

async fn is_running(state: &State, challenge_name: &str, team_id: &str) -> bool {
    !get_containers(state, challenge_name, team_id, true, Some(1))
        .await
        .is_empty()
}

/// Makes sure a managed network exists, creating it when missing, and wires
/// the edge proxy into internal (service) networks. A 409 on the proxy
/// connect means it is already attached and is ignored.
async fn ensure_network(state: &State, name: &str, internal: bool, expires_at: i64) -> Result<()> {
    if state.docker.inspect_network(name).await.is_err() {
        let request = NetworkCreateRequest {
            name: name.to_owned(),
            driver: Some("bridge".to_owned()),
            internal: Some(internal),
            labels: Some(labels::network_labels(&state.config, expires_at)),
            ..Default::default()
        };
        if let Err(err) = state.docker.create_network(request).await {
            if docker::is_pool_exhausted(&err) {
                return Err(Error::SubnetsExhausted);
            }
            return Err(err.into());
        }
    }

    if internal {
        if let Err(err) = state
            .docker
            .connect_network(name, &state.config.traefik_container_name)
            .await
        {
            if !docker::is_conflict(&err) {
                return Err(err.into());
            }
        }
    }

    Ok(())
}

async fn cleanup_containers(docker: &DockerClient, names: &[String]) {
    if names.is_empty() {
        return;
    }

    let deletions = names.iter().map(|name| async move {
        if let Err(err) = docker.remove_container(name).await {
            warn!("Failed to remove container {name} during cleanup: {err}");
        }
    });
    join_all(deletions).await;
}

/// Force-disconnects everything still attached to each named network, then
/// deletes the networks. Disconnects across all networks run concurrently,
/// then all deletions. Shared by start rollback, stop, and the pruner;
/// every step is best-effort.
pub(crate) async fn cleanup_networks(docker: &DockerClient, names: &[String]) {
    if names.is_empty() {
        return;
    }

    let mut disconnects = Vec::new();
    let mut to_delete = Vec::new();
    for name in names {
        match docker.inspect_network(name).await {
            Ok(network) => {
                for attached in network.containers.unwrap_or_default().into_values() {
                    if let Some(container) = attached.name {
                        disconnects.push((name.clone(), container));
                    }
                }
                to_delete.push(name.clone());
            }
            Err(err) => {
                if !docker::is_not_found(&err) {
                    warn!("Failed to fetch network during cleanup: {name}: {err}");
                }
            }
        }
    }

    join_all(disconnects.iter().map(|(network, container)| async move {
        info!("Disconnecting container {container} from network {network}");
        if let Err(err) = docker.disconnect_network(network, container, true).await {
            warn!("Failed to disconnect {container} from network {network}: {err}");
        }
    }))
    .await;

    join_all(to_delete.iter().map(|name| async move {
        info!("Removing network {name}");
        if let Err(err) = docker.remove_network(name).await {
            warn!("Failed to remove network {name}: {err}");
        }
    }))
    .await;
}

/// Resources created by an in-flight start, undone in reverse dependency
/// order when any step fails.
#[derive(Default)]
struct Rollback {
    containers: Vec<String>,
    networks: Vec<String>,
}

impl Rollback {
    fn container(&mut self, name: &str) {
        self.containers.push(name.to_owned());
    }

    fn network(&mut self, name: &str) {
        self.networks.push(name.to_owned());
    }

    async fn run(self, docker: &DockerClient) {
        cleanup_containers(docker, &self.containers).await;
        cleanup_networks(docker, &self.networks).await;
    }
}

fn endpoints_for(
    config: &Config,
    challenge: &Challenge,
    host: Option<&str>,
) -> Option<Vec<Endpoint>> {
    let host = host?;
    Some(
        challenge
            .expose
            .iter()
            .map(|expose| Endpoint {
                kind: expose.kind,
                host: host.to_owned(),
                port: config.entrypoint_port(expose.kind),
            })
            .collect(),
    )
}

fn host_config(container: &Container) -> HostConfig {
    let security = &container.security;
    let limits = &container.limits;

    let tmpfs = security
        .read_only_fs
        .then(|| HashMap::from([("/tmp".to_owned(), "noexec,nosuid,nodev".to_owned())]));

    HostConfig {
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            ..Default::default()
        }),
        readonly_rootfs: Some(security.read_only_fs),
        tmpfs,
        security_opt: Some(security.security_opt.clone()),
        memory: Some(limits.memory_bytes()),
        memory_swap: Some(limits.memory_bytes()),
        nano_cpus: Some(limits.nano_cpus()),
        pids_limit: Some(limits.pids_limit),
        cap_add: Some(security.cap_add.clone()),
        cap_drop: Some(security.cap_drop.clone()),
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_owned()),
            ..Default::default()
        }),
        ulimits: Some(
            limits
                .ulimits
                .iter()
                .map(|u| ResourcesUlimits {
                    name: Some(u.name.clone()),
                    soft: Some(u.soft),
                    hard: Some(u.hard),
                })
                .collect(),
        ),
        ..Default::default()
    }
}

struct StartPlan<'a> {
    challenge: &'a Challenge,
    team_id: &'a str,
    instance_id: String,
    host: String,
    svc_net: String,
    eg_net: String,
    started_at: i64,
    expires_at: i64,
}

async fn provision(state: &State, plan: &StartPlan<'_>, rollback: &mut Rollback) -> Result<()> {
    let config = &state.config;
    let challenge = plan.challenge;

    ensure_network(state, &plan.svc_net, true, plan.expires_at).await?;
    rollback.network(&plan.svc_net);

    if challenge.needs_egress() {
        ensure_network(state, &plan.eg_net, false, plan.expires_at).await?;
        rollback.network(&plan.eg_net);
    }

    for container in &challenge.containers {
        state.docker.ensure_image(&container.image).await?;

        let mut container_labels = labels::managed_labels(
            config,
            &challenge.name,
            plan.team_id,
            &plan.host,
            &plan.instance_id,
            plan.started_at,
            plan.expires_at,
        );
        container_labels.extend(labels::edge_labels(
            config,
            challenge,
            container,
            plan.team_id,
            &plan.instance_id,
            &plan.host,
            &plan.svc_net,
        ));

        let mut endpoints_config =
            HashMap::from([(plan.svc_net.clone(), EndpointSettings::default())]);
        if container.egress {
            endpoints_config.insert(plan.eg_net.clone(), EndpointSettings::default());
        }

        let name = container_name(config, &challenge.name, plan.team_id, &container.name);
        info!(
            "Spinning up container {name} challenge={} team={}",
            challenge.name, plan.team_id
        );

        let body = ContainerCreateBody {
            hostname: Some(container.name.clone()),
            image: Some(container.image.clone()),
            env: Some(
                container
                    .env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            labels: Some(container_labels),
            host_config: Some(host_config(container)),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints_config),
            }),
            ..Default::default()
        };

        state.docker.create_container(&name, body).await?;
        rollback.container(&name);
    }

    let starts = rollback
        .containers
        .iter()
        .map(|name| state.docker.start_container(name));
    try_join_all(starts).await?;

    Ok(())
}

pub async fn start_instance(state: &State, challenge_name: &str, team_id: &str) -> Result<Instance> {
    let challenge = state
        .catalog
        .get(challenge_name)
        .ok_or(Error::ChallengeNotFound)?;

    state
        .locks
        .with_lock(challenge_name, team_id, async {
            if is_running(state, challenge_name, team_id).await {
                return Err(Error::AlreadyRunning);
            }

            let started_at = timestamp();
            let expires_at = started_at + challenge.timeout as i64;
            let instance_id = nanoid!(12, &INSTANCE_ID_ALPHABET);

            let plan = StartPlan {
                challenge,
                team_id,
                host: instance_host(&state.config, challenge_name, &instance_id),
                svc_net: service_network_name(&state.config, challenge_name, team_id, &instance_id),
                eg_net: egress_network_name(&state.config, challenge_name, team_id, &instance_id),
                instance_id,
                started_at,
                expires_at,
            };

            let mut rollback = Rollback::default();
            if let Err(err) = provision(state, &plan, &mut rollback).await {
                error!("Failed to start instance: challenge={challenge_name} team={team_id}: {err}");
                rollback.run(&state.docker).await;
                return Err(err);
            }

            Ok(Instance {
                status: InstanceStatus::Starting,
                timeout: challenge.timeout,
                endpoints: endpoints_for(&state.config, challenge, Some(&plan.host)),
                remaining_time: Some(expires_at - timestamp()),
            })
        })
        .await
}

pub async fn stop_instance(state: &State, challenge_name: &str, team_id: &str) -> Result<Instance> {
    state
        .locks
        .with_lock(challenge_name, team_id, async {
            let containers = get_containers(state, challenge_name, team_id, false, None).await;
            if containers.is_empty() {
                return Err(Error::InstanceNotFound);
            }

            let net_prefix = format!("{}-", state.config.prefix);
            let mut networks_to_remove = HashSet::new();
            let mut ids = Vec::new();

            for container in &containers {
                let Some(id) = container.id.as_deref() else {
                    continue;
                };
                let details = state.docker.inspect_container(id).await?;
                if let Some(nets) = details.network_settings.and_then(|s| s.networks) {
                    // tear down only our own networks
                    for net_name in nets.keys() {
                        if net_name.starts_with(&net_prefix) {
                            networks_to_remove.insert(net_name.clone());
                        }
                    }
                }
                ids.push(id.to_owned());
            }

            let stop_timeout = state.config.docker_stop_timeout_seconds;
            join_all(ids.iter().map(|id| async move {
                info!("Stopping container {id} challenge={challenge_name} team={team_id}");
                if let Err(err) = state.docker.stop_container(id, stop_timeout).await {
                    warn!("Failed to stop container {id}: {err}");
                }
            }))
            .await;

            join_all(ids.iter().map(|id| async move {
                if let Err(err) = state.docker.remove_container(id).await {
                    warn!("Failed to remove container {id}: {err}");
                }
            }))
            .await;
            info!("Removed {} containers.", ids.len());

            let networks: Vec<String> = networks_to_remove.into_iter().collect();
            cleanup_networks(&state.docker, &networks).await;
            info!("Removed {} networks.", networks.len());

            let challenge = state
                .catalog
                .get(challenge_name)
                .ok_or(Error::ChallengeNotFound)?;
            Ok(Instance {
                status: InstanceStatus::Stopped,
                timeout: challenge.timeout,
                endpoints: None,
                remaining_time: None,
            })
        })
        .await
}

/// Lock-free read of the current instance state. Samples a single
/// container; its daemon state stands in for the whole instance.
pub async fn get_instance(state: &State, challenge_name: &str, team_id: &str) -> Result<Instance> {
    let containers = get_containers(state, challenge_name, team_id, false, Some(1)).await;

    let mut status = InstanceStatus::Stopped;
    let mut expires_at = None;
    let mut host = None;

    if let Some(id) = containers.first().and_then(|c| c.id.as_deref()) {
        let details = state.docker.inspect_container(id).await?;

        let running = details.state.as_ref().and_then(|s| s.status)
            == Some(ContainerStateStatusEnum::RUNNING);
        status = if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Starting
        };

        let container_labels = details.config.and_then(|c| c.labels).unwrap_or_default();
        expires_at = container_labels
            .get(labels::EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok());
        host = container_labels.get(labels::TARGET_HOSTNAME).cloned();
    }

    let challenge = state
        .catalog
        .get(challenge_name)
        .ok_or(Error::ChallengeNotFound)?;
    Ok(Instance {
        status,
        timeout: challenge.timeout,
        endpoints: endpoints_for(&state.config, challenge, host.as_deref()),
        remaining_time: expires_at.map(|at| (at - timestamp()).max(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(yaml: &str) -> Challenge {
        let mut challenge: Challenge = serde_yaml::from_str(yaml).unwrap();
        challenge.validate().unwrap();
        challenge
    }

    fn web1() -> Challenge {
        challenge(
            r#"
name: web1
timeout: 900
containers:
  - name: app
    image: demo:1
expose:
  - kind: https
    container_name: app
    container_port: 8080
"#,
        )
    }

    #[test]
    fn container_names_are_deterministic_per_key() {
        let config = Config::for_tests();
        assert_eq!(
            container_name(&config, "web1", "team-a", "app"),
            "wd-web1-team-a-app"
        );
        assert_eq!(
            container_name(&config, "web1", "team-a", "app"),
            container_name(&config, "web1", "team-a", "app"),
        );
    }

    #[test]
    fn network_names_differ_only_by_instance_id() {
        let config = Config::for_tests();
        let first = service_network_name(&config, "web1", "team-a", "aaaaaaaaaaaa");
        let second = service_network_name(&config, "web1", "team-a", "bbbbbbbbbbbb");
        assert_eq!(first, "wd-svc-web1-team-a-aaaaaaaaaaaa");
        assert_ne!(first, second);
        assert_eq!(
            first.replace("aaaaaaaaaaaa", ""),
            second.replace("bbbbbbbbbbbb", "")
        );
        assert_eq!(
            egress_network_name(&config, "web1", "team-a", "aaaaaaaaaaaa"),
            "wd-eg-web1-team-a-aaaaaaaaaaaa"
        );
    }

    #[test]
    fn instance_hosts_embed_challenge_and_id() {
        let config = Config::for_tests();
        assert_eq!(
            instance_host(&config, "web1", "aabbccddeeff"),
            "web1-aabbccddeeff.example.org"
        );
    }

    #[test]
    fn instance_ids_are_twelve_hex_chars() {
        let id = nanoid!(12, &INSTANCE_ID_ALPHABET);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn search_filters_pin_all_three_labels() {
        let config = Config::for_tests();
        let filters = search_filters(&config, "web1", "team-a");
        let labels = &filters["label"];
        assert_eq!(labels.len(), 3);
        assert!(labels.contains(&"warden.managed_by=warden".to_owned()));
        assert!(labels.contains(&"warden.challenge=web1".to_owned()));
        assert!(labels.contains(&"warden.team_id=team-a".to_owned()));
    }

    #[test]
    fn manager_filters_only_pin_the_manager_label() {
        let config = Config::for_tests();
        let filters = manager_filters(&config);
        assert_eq!(filters["label"], vec!["warden.managed_by=warden"]);
    }

    #[test]
    fn endpoints_need_a_host() {
        let config = Config::for_tests();
        let challenge = web1();
        assert!(endpoints_for(&config, &challenge, None).is_none());

        let endpoints = endpoints_for(&config, &challenge, Some("web1-abc.example.org")).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].kind, ExposeKind::Https);
        assert_eq!(endpoints[0].host, "web1-abc.example.org");
        assert_eq!(endpoints[0].port, 443);
    }

    #[test]
    fn host_config_applies_hardening_and_limits() {
        let challenge = web1();
        let config = host_config(&challenge.containers[0]);

        assert_eq!(config.readonly_rootfs, Some(true));
        assert!(config.tmpfs.unwrap().contains_key("/tmp"));
        assert_eq!(config.memory, Some(512 * 1024 * 1024));
        assert_eq!(config.memory_swap, Some(512 * 1024 * 1024));
        assert_eq!(config.nano_cpus, Some(500_000_000));
        assert_eq!(config.pids_limit, Some(1024));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_owned()]));
        assert_eq!(
            config.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        let ulimits = config.ulimits.unwrap();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
    }

    #[test]
    fn writable_rootfs_skips_the_tmpfs_mount() {
        let mut challenge = web1();
        challenge.containers[0].security.read_only_fs = false;
        let config = host_config(&challenge.containers[0]);
        assert_eq!(config.readonly_rootfs, Some(false));
        assert!(config.tmpfs.is_none());
    }

    #[test]
    fn rollback_tracks_resources_in_creation_order() {
        let mut rollback = Rollback::default();
        rollback.network("wd-svc-web1-team-a-abc");
        rollback.container("wd-web1-team-a-app");
        rollback.container("wd-web1-team-a-db");
        assert_eq!(rollback.networks, vec!["wd-svc-web1-team-a-abc"]);
        assert_eq!(
            rollback.containers,
            vec!["wd-web1-team-a-app", "wd-web1-team-a-db"]
        );
    }
}
