use std::collections::{HashMap, HashSet};

use eyre::{Result, WrapErr, eyre};
use log::warn;
use serde::{Deserialize, Serialize};

pub const NANO_CPU_SCALE: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposeKind {
    Https,
    Http,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Expose {
    pub kind: ExposeKind,
    pub container_name: String,
    pub container_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Security {
    pub read_only_fs: bool,
    pub security_opt: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            read_only_fs: true,
            security_opt: vec!["no-new-privileges".to_owned()],
            cap_add: vec![],
            cap_drop: vec!["ALL".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    pub memory: String,
    pub cpu: String,
    pub pids_limit: i64,
    pub ulimits: Vec<Ulimit>,
    // resolved by Challenge::validate
    #[serde(skip)]
    memory_bytes: i64,
    #[serde(skip)]
    nano_cpus: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory: "512m".to_owned(),
            cpu: "0.5".to_owned(),
            pids_limit: 1024,
            ulimits: vec![Ulimit {
                name: "nofile".to_owned(),
                soft: 1024,
                hard: 1024,
            }],
            memory_bytes: 0,
            nano_cpus: 0,
        }
    }
}

impl Limits {
    /// Memory limit in bytes. Zero until [`Challenge::validate`] has run.
    pub fn memory_bytes(&self) -> i64 {
        self.memory_bytes
    }

    /// CPU limit in units of 10^-9 CPUs. Zero until [`Challenge::validate`] has run.
    pub fn nano_cpus(&self) -> i64 {
        self.nano_cpus
    }

    fn resolve(&mut self) -> Result<()> {
        self.memory_bytes = parse_memory(&self.memory)?;
        self.nano_cpus = parse_cpu(&self.cpu)?;
        if self.memory_bytes <= 0 {
            return Err(eyre!("memory limit \"{}\" is not positive", self.memory));
        }
        if self.nano_cpus <= 0 {
            return Err(eyre!("cpu limit \"{}\" is not positive", self.cpu));
        }
        if self.pids_limit <= 0 {
            return Err(eyre!("pids_limit {} is not positive", self.pids_limit));
        }
        Ok(())
    }
}

// Two-letter suffixes first so "512kb" doesn't match the bare "b".
const MEMORY_SUFFIXES: &[(&str, i64)] = &[
    ("kb", 1 << 10),
    ("ki", 1 << 10),
    ("mb", 1 << 20),
    ("mi", 1 << 20),
    ("gb", 1 << 30),
    ("gi", 1 << 30),
    ("tb", 1_i64 << 40),
    ("b", 1),
    ("k", 1 << 10),
    ("m", 1 << 20),
    ("g", 1 << 30),
    ("t", 1_i64 << 40),
];

/// Parses a human memory limit ("512m", "1.5g", "1024") into bytes.
/// Fractional values are truncated.
pub fn parse_memory(value: &str) -> Result<i64> {
    let mem = value.trim().to_lowercase();
    if mem.is_empty() {
        return Err(eyre!("empty memory limit"));
    }

    for (suffix, multiplier) in MEMORY_SUFFIXES {
        if let Some(number) = mem.strip_suffix(suffix) {
            let number = number
                .parse::<f64>()
                .map_err(|_| eyre!("invalid memory limit \"{value}\""))?;
            return Ok((number * *multiplier as f64) as i64);
        }
    }

    mem.parse::<i64>()
        .map_err(|_| eyre!("invalid memory limit \"{value}\""))
}

/// Parses a cpu limit into nano-CPUs: a trailing "m" means millicores
/// ("500m" = half a core), anything else is a floating core count.
pub fn parse_cpu(value: &str) -> Result<i64> {
    let cpu = value.trim();
    if cpu.is_empty() {
        return Err(eyre!("empty cpu limit"));
    }

    if let Some(millis) = cpu.strip_suffix('m') {
        let millicores = millis
            .parse::<i64>()
            .map_err(|_| eyre!("invalid cpu limit \"{value}\""))?;
        return Ok(millicores * NANO_CPU_SCALE / 1000);
    }

    let cores = cpu
        .parse::<f64>()
        .map_err(|_| eyre!("invalid cpu limit \"{value}\""))?;
    Ok((cores * NANO_CPU_SCALE as f64) as i64)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub egress: bool,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Challenge {
    pub name: String,
    pub timeout: u64,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub expose: Vec<Expose>,
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl Challenge {
    /// Checks every invariant the instance lifecycle depends on and caches
    /// the parsed resource limits. Must run once before the challenge is
    /// served; a challenge that fails here is dropped from the catalog.
    pub fn validate(&mut self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(eyre!(
                "challenge name \"{}\" is invalid, must match [a-z0-9-]+",
                self.name
            ));
        }
        if self.timeout == 0 {
            return Err(eyre!("challenge \"{}\" needs a positive timeout", self.name));
        }
        if self.containers.is_empty() {
            return Err(eyre!("challenge \"{}\" has no containers", self.name));
        }

        let mut names = HashSet::new();
        for container in &mut self.containers {
            if !is_valid_name(&container.name) {
                return Err(eyre!(
                    "container name \"{}\" in challenge \"{}\" is invalid, must match [a-z0-9-]+",
                    container.name,
                    self.name
                ));
            }
            if !names.insert(container.name.clone()) {
                return Err(eyre!(
                    "duplicate container \"{}\" in challenge \"{}\"",
                    container.name,
                    self.name
                ));
            }

            container
                .limits
                .resolve()
                .wrap_err_with(|| format!("container \"{}\"", container.name))?;

            if !container.security.read_only_fs {
                warn!(
                    "Container \"{}\" in challenge \"{}\" has read_only_fs set to false.",
                    container.name, self.name
                );
            }
            if container.security.security_opt.is_empty() {
                warn!(
                    "Container \"{}\" in challenge \"{}\" has an empty security_opt list.",
                    container.name, self.name
                );
            }
        }

        for expose in &self.expose {
            if !names.contains(&expose.container_name) {
                return Err(eyre!(
                    "expose references unknown container \"{}\" in challenge \"{}\"",
                    expose.container_name,
                    self.name
                ));
            }
        }

        Ok(())
    }

    /// Whether any container wants an external-facing network.
    pub fn needs_egress(&self) -> bool {
        self.containers.iter().any(|c| c.egress)
    }
}
