use std::{collections::HashMap, path::Path};

use eyre::{Result, eyre};
use log::{error, info, warn};
use serde::Deserialize;
use warden_common::challenge::Challenge;

/// In-memory challenge catalog. Loaded once at startup and immutable
/// afterwards; the lifecycle never re-reads it.
pub struct ChallengeCatalog {
    challenges: HashMap<String, Challenge>,
}

impl ChallengeCatalog {
    /// Loads every challenge document reachable from `path`: either a single
    /// YAML file or a directory scanned recursively for `challenge.yml` /
    /// `challenge.yaml`. Documents that fail to parse or validate are logged
    /// and skipped so one broken challenge cannot take the rest down.
    pub fn load(path: &Path) -> Result<Self> {
        let mut files = Vec::new();
        if path.is_file() {
            files.push(path.to_path_buf());
        } else if path.is_dir() {
            for file_name in ["challenge.yml", "challenge.yaml"] {
                let pattern = path.join("**").join(file_name);
                let pattern = pattern
                    .to_str()
                    .ok_or_else(|| eyre!("bad string for pattern"))?;
                for entry in glob::glob(pattern)? {
                    match entry {
                        Ok(file) => files.push(file),
                        Err(err) => warn!("Skipping unreadable path: {err}"),
                    }
                }
            }
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            warn!(
                "No challenge configuration files found in {}",
                path.display()
            );
        }

        let mut challenges = HashMap::new();
        for file in &files {
            info!("Loading challenges from {}", file.display());
            let content = match std::fs::read_to_string(file) {
                Ok(content) => content,
                Err(err) => {
                    error!("Error reading {}: {err}", file.display());
                    continue;
                }
            };
            for challenge in parse_stream(&content, &file.display().to_string()) {
                challenges.insert(challenge.name.clone(), challenge);
            }
        }

        info!(
            "Loaded {} challenges from {} files.",
            challenges.len(),
            files.len()
        );
        Ok(Self { challenges })
    }

    pub fn get(&self, name: &str) -> Option<&Challenge> {
        self.challenges.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &Challenge> {
        self.challenges.values()
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

/// Parses a multi-document YAML stream. A document that fails to
/// deserialize or validate is dropped; the rest of the stream still loads.
fn parse_stream(content: &str, source: &str) -> Vec<Challenge> {
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        match Challenge::deserialize(document) {
            Ok(mut challenge) => match challenge.validate() {
                Ok(()) => {
                    info!("Loaded challenge \"{}\" from {source}", challenge.name);
                    out.push(challenge);
                }
                Err(err) => error!("Validation error in {source}: {err:#}"),
            },
            Err(err) => error!("Validation error in {source}: {err}"),
        }
    }
    out
}
