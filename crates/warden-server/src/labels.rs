//! Managed-resource labels and the edge-proxy routing-label synthesis.
//!
//! Labels are the only persistence layer: everything `status` and the
//! pruner know about an instance is read back from here.

use std::collections::HashMap;

use warden_common::challenge::{Challenge, Container, ExposeKind};

use crate::config::Config;

/// Primary discovery filter; its value is the configured manager name.
pub const MANAGED_BY: &str = "warden.managed_by";
pub const CHALLENGE: &str = "warden.challenge";
pub const TEAM_ID: &str = "warden.team_id";
pub const TARGET_HOSTNAME: &str = "warden.hostname";
pub const INSTANCE_ID: &str = "warden.instance_id";
pub const STARTED_AT: &str = "warden.started_at";
pub const EXPIRES_AT: &str = "warden.expires_at";

/// The full label set stamped on every managed container.
pub fn managed_labels(
    config: &Config,
    challenge_name: &str,
    team_id: &str,
    host: &str,
    instance_id: &str,
    started_at: i64,
    expires_at: i64,
) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_BY.to_owned(), config.docker_manager_name.clone()),
        (CHALLENGE.to_owned(), challenge_name.to_owned()),
        (TEAM_ID.to_owned(), team_id.to_owned()),
        (TARGET_HOSTNAME.to_owned(), host.to_owned()),
        (INSTANCE_ID.to_owned(), instance_id.to_owned()),
        (STARTED_AT.to_owned(), started_at.to_string()),
        (EXPIRES_AT.to_owned(), expires_at.to_string()),
    ])
}

/// Labels stamped on managed networks; the pruner only needs the expiry.
pub fn network_labels(config: &Config, expires_at: i64) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_BY.to_owned(), config.docker_manager_name.clone()),
        (EXPIRES_AT.to_owned(), expires_at.to_string()),
    ])
}

pub fn router_name(
    config: &Config,
    challenge_name: &str,
    team_id: &str,
    instance_id: &str,
    container_name: &str,
    index: usize,
) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}",
        config.prefix, challenge_name, team_id, instance_id, container_name, index
    )
}

/// Routing labels for one container of an instance. Pure and deterministic:
/// the same inputs always yield the same map.
///
/// When the challenge exposes anything, every container gets the common
/// `traefik.enable` / `traefik.docker.network` pair; the per-router labels
/// only land on containers an expose rule targets.
pub fn edge_labels(
    config: &Config,
    challenge: &Challenge,
    container: &Container,
    team_id: &str,
    instance_id: &str,
    host: &str,
    svc_net: &str,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    if challenge.expose.is_empty() {
        return labels;
    }

    labels.insert("traefik.enable".to_owned(), "true".to_owned());
    labels.insert("traefik.docker.network".to_owned(), svc_net.to_owned());

    for (i, expose) in challenge.expose.iter().enumerate() {
        if expose.container_name != container.name {
            continue;
        }

        let router = router_name(
            config,
            &challenge.name,
            team_id,
            instance_id,
            &container.name,
            i,
        );
        let port = expose.container_port.to_string();

        match expose.kind {
            ExposeKind::Tcp => {
                labels.insert(
                    format!("traefik.tcp.routers.{router}.rule"),
                    format!("HostSNI(`{host}`)"),
                );
                labels.insert(
                    format!("traefik.tcp.routers.{router}.entrypoints"),
                    config.traefik_tcp_entrypoint.clone(),
                );
                labels.insert(format!("traefik.tcp.routers.{router}.service"), router.clone());
                labels.insert(
                    format!("traefik.tcp.routers.{router}.tls.passthrough"),
                    "true".to_owned(),
                );
                labels.insert(
                    format!("traefik.tcp.services.{router}.loadbalancer.server.port"),
                    port,
                );
            }
            ExposeKind::Http => {
                labels.insert(
                    format!("traefik.http.routers.{router}.rule"),
                    format!("Host(`{host}`)"),
                );
                labels.insert(
                    format!("traefik.http.routers.{router}.entrypoints"),
                    config.traefik_http_entrypoint.clone(),
                );
                labels.insert(format!("traefik.http.routers.{router}.service"), router.clone());
                labels.insert(
                    format!("traefik.http.services.{router}.loadbalancer.server.port"),
                    port,
                );
            }
            ExposeKind::Https => {
                labels.insert(
                    format!("traefik.http.routers.{router}.rule"),
                    format!("Host(`{host}`)"),
                );
                labels.insert(
                    format!("traefik.http.routers.{router}.entrypoints"),
                    config.traefik_https_entrypoint.clone(),
                );
                labels.insert(format!("traefik.http.routers.{router}.tls"), "true".to_owned());
                labels.insert(format!("traefik.http.routers.{router}.service"), router.clone());
                labels.insert(
                    format!("traefik.http.services.{router}.loadbalancer.server.port"),
                    port,
                );
            }
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(yaml: &str) -> Challenge {
        let mut challenge: Challenge = serde_yaml::from_str(yaml).unwrap();
        challenge.validate().unwrap();
        challenge
    }

    fn exposed() -> Challenge {
        challenge(
            r#"
name: web1
timeout: 900
containers:
  - name: app
    image: demo:1
  - name: db
    image: postgres:16
expose:
  - kind: https
    container_name: app
    container_port: 8080
  - kind: tcp
    container_name: app
    container_port: 1234
"#,
        )
    }

    #[test]
    fn managed_labels_carry_all_seven_keys() {
        let config = Config::for_tests();
        let labels = managed_labels(&config, "web1", "team-a", "h", "aabbccddeeff", 1000, 1900);
        for key in [
            MANAGED_BY,
            CHALLENGE,
            TEAM_ID,
            TARGET_HOSTNAME,
            INSTANCE_ID,
            STARTED_AT,
            EXPIRES_AT,
        ] {
            assert!(labels.contains_key(key), "missing {key}");
        }
        assert_eq!(labels[MANAGED_BY], "warden");
        assert_eq!(labels[EXPIRES_AT], "1900");
    }

    #[test]
    fn network_labels_carry_expiry() {
        let config = Config::for_tests();
        let labels = network_labels(&config, 1900);
        assert_eq!(labels[MANAGED_BY], "warden");
        assert_eq!(labels[EXPIRES_AT], "1900");
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn edge_labels_are_deterministic() {
        let config = Config::for_tests();
        let challenge = exposed();
        let container = &challenge.containers[0];
        let first = edge_labels(
            &config, &challenge, container, "team-a", "aabbccddeeff", "h.example.org", "net",
        );
        let second = edge_labels(
            &config, &challenge, container, "team-a", "aabbccddeeff", "h.example.org", "net",
        );
        assert_eq!(first, second);
    }

    #[test]
    fn https_expose_produces_tls_router() {
        let config = Config::for_tests();
        let challenge = exposed();
        let labels = edge_labels(
            &config,
            &challenge,
            &challenge.containers[0],
            "team-a",
            "aabbccddeeff",
            "web1-aabbccddeeff.example.org",
            "wd-svc-web1-team-a-aabbccddeeff",
        );

        let router = "wd-web1-team-a-aabbccddeeff-app-0";
        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(
            labels["traefik.docker.network"],
            "wd-svc-web1-team-a-aabbccddeeff"
        );
        assert_eq!(
            labels[&format!("traefik.http.routers.{router}.rule")],
            "Host(`web1-aabbccddeeff.example.org`)"
        );
        assert_eq!(
            labels[&format!("traefik.http.routers.{router}.entrypoints")],
            "websecure"
        );
        assert_eq!(labels[&format!("traefik.http.routers.{router}.tls")], "true");
        assert_eq!(labels[&format!("traefik.http.routers.{router}.service")], router);
        assert_eq!(
            labels[&format!("traefik.http.services.{router}.loadbalancer.server.port")],
            "8080"
        );
    }

    #[test]
    fn tcp_expose_produces_sni_passthrough_router() {
        let config = Config::for_tests();
        let challenge = exposed();
        let labels = edge_labels(
            &config,
            &challenge,
            &challenge.containers[0],
            "team-a",
            "aabbccddeeff",
            "web1-aabbccddeeff.example.org",
            "net",
        );

        let router = "wd-web1-team-a-aabbccddeeff-app-1";
        assert_eq!(
            labels[&format!("traefik.tcp.routers.{router}.rule")],
            "HostSNI(`web1-aabbccddeeff.example.org`)"
        );
        assert_eq!(
            labels[&format!("traefik.tcp.routers.{router}.entrypoints")],
            "tcp"
        );
        assert_eq!(
            labels[&format!("traefik.tcp.routers.{router}.tls.passthrough")],
            "true"
        );
        assert_eq!(
            labels[&format!("traefik.tcp.services.{router}.loadbalancer.server.port")],
            "1234"
        );
    }

    #[test]
    fn unexposed_container_still_gets_common_labels_only() {
        let config = Config::for_tests();
        let challenge = exposed();
        let labels = edge_labels(
            &config,
            &challenge,
            &challenge.containers[1],
            "team-a",
            "aabbccddeeff",
            "web1-aabbccddeeff.example.org",
            "net",
        );
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(labels["traefik.docker.network"], "net");
    }

    #[test]
    fn no_expose_rules_mean_no_labels() {
        let config = Config::for_tests();
        let challenge = challenge(
            r#"
name: batch
timeout: 60
containers:
  - name: worker
    image: demo:1
"#,
        );
        let labels = edge_labels(
            &config,
            &challenge,
            &challenge.containers[0],
            "team-a",
            "aabbccddeeff",
            "h",
            "net",
        );
        assert!(labels.is_empty());
    }
}
