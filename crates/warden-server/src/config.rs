use std::{collections::HashMap, ops::Deref, path::PathBuf, str::FromStr, sync::Arc};

use envconfig::Envconfig;
use eyre::eyre;
use warden_common::challenge::ExposeKind;

use crate::{
    auth::Authenticator,
    cache::{LockService, TokenCache},
    catalog::ChallengeCatalog,
    docker::DockerClient,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProviderKind {
    Local,
    Jwt,
    Platform,
}

impl FromStr for AuthProviderKind {
    type Err = eyre::Error;

    fn from_str(s: &str) -> eyre::Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "jwt" => Ok(Self::Jwt),
            "platform" => Ok(Self::Platform),
            other => Err(eyre!("unsupported auth provider {other}")),
        }
    }
}

/// Provider-specific arguments, passed as a JSON object in the environment,
/// e.g. `AUTH_PROVIDER_ARGS={"secret": "..."}`.
#[derive(Debug, Clone, Default)]
pub struct AuthProviderArgs(HashMap<String, String>);

impl FromStr for AuthProviderArgs {
    type Err = eyre::Error;

    fn from_str(s: &str) -> eyre::Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(serde_json::from_str(s)?))
    }
}

impl Deref for AuthProviderArgs {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub bind_host: String,
    #[envconfig(from = "BIND_PORT", default = "1337")]
    pub bind_port: u16,
    #[envconfig(from = "WEB_WORKERS", default = "2")]
    pub web_workers: usize,
    #[envconfig(from = "USE_PROXY_HEADERS", default = "false")]
    pub use_proxy_headers: bool,

    #[envconfig(from = "AUTH_PROVIDER", default = "local")]
    pub auth_provider: AuthProviderKind,
    #[envconfig(from = "AUTH_PROVIDER_ARGS", default = "{}")]
    pub auth_provider_args: AuthProviderArgs,

    #[envconfig(from = "CHALLENGES_YAML_PATH", default = "challenges.yaml")]
    pub challenges_yaml_path: PathBuf,

    #[envconfig(from = "TRAEFIK_CONTAINER_NAME", default = "wd-traefik")]
    pub traefik_container_name: String,
    #[envconfig(from = "TRAEFIK_HTTP_ENTRYPOINT", default = "web")]
    pub traefik_http_entrypoint: String,
    #[envconfig(from = "TRAEFIK_HTTP_PORT", default = "80")]
    pub traefik_http_port: u16,
    #[envconfig(from = "TRAEFIK_HTTPS_ENTRYPOINT", default = "websecure")]
    pub traefik_https_entrypoint: String,
    #[envconfig(from = "TRAEFIK_HTTPS_PORT", default = "443")]
    pub traefik_https_port: u16,
    #[envconfig(from = "TRAEFIK_TCP_ENTRYPOINT", default = "tcp")]
    pub traefik_tcp_entrypoint: String,
    #[envconfig(from = "TRAEFIK_TCP_PORT", default = "1337")]
    pub traefik_tcp_port: u16,

    /// Value of the managed-by label, the primary discovery filter.
    #[envconfig(from = "DOCKER_MANAGER_NAME", default = "warden")]
    pub docker_manager_name: String,
    /// Name prefix for every created container and network.
    #[envconfig(from = "PREFIX", default = "wd")]
    pub prefix: String,

    /// DNS suffix under which instance hostnames are handed out.
    #[envconfig(from = "INSTANCES_HOST")]
    pub instances_host: String,

    #[envconfig(from = "REDIS_HOST", default = "localhost")]
    pub redis_host: String,
    #[envconfig(from = "REDIS_PORT_NUMBER", default = "6379")]
    pub redis_port: u16,
    #[envconfig(from = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,
    #[envconfig(from = "REDIS_LOCK_TIMEOUT_SECONDS", default = "60")]
    pub redis_lock_timeout_seconds: u64,
    #[envconfig(from = "REDIS_LOCK_BLOCKING_TIMEOUT_SECONDS", default = "30")]
    pub redis_lock_blocking_timeout_seconds: u64,

    #[envconfig(from = "DOCKER_STOP_TIMEOUT_SECONDS", default = "5")]
    pub docker_stop_timeout_seconds: i32,

    #[envconfig(from = "PRUNNER_INTERVAL_SECONDS", default = "3")]
    pub prunner_interval_seconds: u64,

    #[envconfig(from = "AUTH_CACHE_LIFE_TIME", default = "1209600")]
    pub auth_cache_life_time: u64,

    #[envconfig(from = "HCAPTCHA_SECRET")]
    pub hcaptcha_secret: Option<String>,
    #[envconfig(from = "HCAPTCHA_SITE_KEY")]
    pub hcaptcha_site_key: Option<String>,
}

impl Config {
    pub fn redis_url(&self) -> String {
        match self.redis_password.as_deref() {
            Some(password) if !password.is_empty() => {
                format!("redis://:{password}@{}:{}", self.redis_host, self.redis_port)
            }
            _ => format!("redis://{}:{}", self.redis_host, self.redis_port),
        }
    }

    /// Captcha is disabled wholesale unless both halves are configured.
    pub fn captcha_enabled(&self) -> bool {
        self.hcaptcha_secret.as_deref().is_some_and(|s| !s.is_empty())
            && self.hcaptcha_site_key.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Advertised edge port for an expose kind.
    pub fn entrypoint_port(&self, kind: ExposeKind) -> u16 {
        match kind {
            ExposeKind::Http => self.traefik_http_port,
            ExposeKind::Https => self.traefik_https_port,
            ExposeKind::Tcp => self.traefik_tcp_port,
        }
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            bind_port: 1337,
            web_workers: 2,
            use_proxy_headers: false,
            auth_provider: AuthProviderKind::Local,
            auth_provider_args: AuthProviderArgs::default(),
            challenges_yaml_path: PathBuf::from("challenges.yaml"),
            traefik_container_name: "wd-traefik".to_owned(),
            traefik_http_entrypoint: "web".to_owned(),
            traefik_http_port: 80,
            traefik_https_entrypoint: "websecure".to_owned(),
            traefik_https_port: 443,
            traefik_tcp_entrypoint: "tcp".to_owned(),
            traefik_tcp_port: 1337,
            docker_manager_name: "warden".to_owned(),
            prefix: "wd".to_owned(),
            instances_host: "example.org".to_owned(),
            redis_host: "localhost".to_owned(),
            redis_port: 6379,
            redis_password: None,
            redis_lock_timeout_seconds: 60,
            redis_lock_blocking_timeout_seconds: 30,
            docker_stop_timeout_seconds: 5,
            prunner_interval_seconds: 3,
            auth_cache_life_time: 3600,
            hcaptcha_secret: None,
            hcaptcha_site_key: None,
        }
    }
}

pub struct StateInner {
    pub config: Config,
    pub catalog: ChallengeCatalog,
    pub docker: DockerClient,
    pub locks: LockService,
    pub tokens: TokenCache,
    pub auth: Authenticator,
    pub http: reqwest::Client,
}

pub type State = Arc<StateInner>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_provider_args_parse_json_maps() {
        let args: AuthProviderArgs = r#"{"secret": "hunter2"}"#.parse().unwrap();
        assert_eq!(args.get("secret").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn empty_auth_provider_args_are_fine() {
        let args: AuthProviderArgs = "".parse().unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn unknown_auth_provider_is_rejected() {
        assert!("oidc".parse::<AuthProviderKind>().is_err());
        assert_eq!(
            "platform".parse::<AuthProviderKind>().unwrap(),
            AuthProviderKind::Platform
        );
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut config = Config::for_tests();
        assert_eq!(config.redis_url(), "redis://localhost:6379");
        config.redis_password = Some("s3cret".to_owned());
        assert_eq!(config.redis_url(), "redis://:s3cret@localhost:6379");
    }

    #[test]
    fn captcha_requires_both_halves() {
        let mut config = Config::for_tests();
        assert!(!config.captcha_enabled());
        config.hcaptcha_secret = Some("secret".to_owned());
        assert!(!config.captcha_enabled());
        config.hcaptcha_site_key = Some("site".to_owned());
        assert!(config.captcha_enabled());
    }

    #[test]
    fn entrypoint_ports_follow_expose_kind() {
        let config = Config::for_tests();
        assert_eq!(config.entrypoint_port(ExposeKind::Http), 80);
        assert_eq!(config.entrypoint_port(ExposeKind::Https), 443);
        assert_eq!(config.entrypoint_port(ExposeKind::Tcp), 1337);
    }
}
