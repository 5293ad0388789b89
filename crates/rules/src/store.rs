use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::error::{Result, RuleError};
use crate::evaluator::CompiledRuleSet;
use crate::lock::KeyedLocks;
use crate::model::RuleSet;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_NAME_LEN: usize = 128;

/// What `put` does when the name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    #[default]
    Reject,
    Overwrite,
}

/// Named rule-set persistence. Every backend validates rule sets on the way
/// in and on the way out, and serializes operations per name.
#[async_trait]
pub trait RuleSetStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<RuleSet>;

    async fn put(&self, name: &str, rule_set: &RuleSet, policy: SavePolicy) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Names in ascending order.
    async fn list(&self) -> Result<Vec<String>>;

    /// Load and compile in one step.
    async fn load_compiled(&self, name: &str) -> Result<CompiledRuleSet> {
        let rule_set = self.get(name).await?;
        CompiledRuleSet::compile(&rule_set)
    }
}

/// Names become file stems, so they are limited to a portable character set.
pub fn validate_rule_set_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));
    if valid {
        Ok(())
    } else {
        Err(RuleError::InvalidRuleSetName(name.to_string()))
    }
}

/// One `<name>.json` file per rule set under a directory.
#[derive(Debug)]
pub struct FileRuleSetStore {
    dir: PathBuf,
    timeout: Duration,
    locks: KeyedLocks,
}

impl FileRuleSetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: DEFAULT_STORE_TIMEOUT,
            locks: KeyedLocks::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            RuleError::StoreUnavailable(format!(
                "{op} timed out after {}ms",
                self.timeout.as_millis()
            ))
        })?
    }

    async fn read_unlocked(&self, name: &str) -> Result<RuleSet> {
        let path = self.path_for(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RuleError::RuleSetNotFound(name.to_string()));
            }
            Err(err) => return Err(unavailable(&path, err)),
        };
        let rule_set: RuleSet =
            serde_json::from_slice(&bytes).map_err(|err| RuleError::CorruptRuleSet {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        CompiledRuleSet::compile(&rule_set)?;
        Ok(rule_set)
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> RuleError {
    RuleError::StoreUnavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl RuleSetStore for FileRuleSetStore {
    async fn get(&self, name: &str) -> Result<RuleSet> {
        validate_rule_set_name(name)?;
        self.bounded("load", async {
            let _guard = self.locks.lock(name).await;
            self.read_unlocked(name).await
        })
        .await
    }

    async fn put(&self, name: &str, rule_set: &RuleSet, policy: SavePolicy) -> Result<()> {
        validate_rule_set_name(name)?;
        CompiledRuleSet::compile(rule_set)?;
        let bytes = serde_json::to_vec_pretty(rule_set).map_err(|err| RuleError::CorruptRuleSet {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

        self.bounded("save", async {
            let _guard = self.locks.lock(name).await;
            let path = self.path_for(name);
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|err| unavailable(&self.dir, err))?;

            let exists = tokio::fs::try_exists(&path)
                .await
                .map_err(|err| unavailable(&path, err))?;
            if exists && policy == SavePolicy::Reject {
                return Err(RuleError::RuleSetNameCollision(name.to_string()));
            }

            let tmp = self.dir.join(format!(".{name}.json.tmp"));
            tokio::fs::write(&tmp, &bytes)
                .await
                .map_err(|err| unavailable(&tmp, err))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|err| unavailable(&path, err))?;
            log::info!(
                "Saved rule set '{name}' ({} rules{})",
                rule_set.rules.len(),
                if exists { ", overwritten" } else { "" }
            );
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_rule_set_name(name)?;
        self.bounded("delete", async {
            let _guard = self.locks.lock(name).await;
            let path = self.path_for(name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    log::info!("Deleted rule set '{name}'");
                    Ok(())
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    Err(RuleError::RuleSetNotFound(name.to_string()))
                }
                Err(err) => Err(unavailable(&path, err)),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.bounded("list", async {
            let mut entries = match tokio::fs::read_dir(&self.dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(unavailable(&self.dir, err)),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| unavailable(&self.dir, err))?
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if validate_rule_set_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }
}

/// In-process backend for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryRuleSetStore {
    sets: RwLock<BTreeMap<String, RuleSet>>,
    locks: KeyedLocks,
}

impl MemoryRuleSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RuleSet>> {
        self.sets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, RuleSet>> {
        self.sets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RuleSetStore for MemoryRuleSetStore {
    async fn get(&self, name: &str) -> Result<RuleSet> {
        validate_rule_set_name(name)?;
        let _guard = self.locks.lock(name).await;
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| RuleError::RuleSetNotFound(name.to_string()))
    }

    async fn put(&self, name: &str, rule_set: &RuleSet, policy: SavePolicy) -> Result<()> {
        validate_rule_set_name(name)?;
        CompiledRuleSet::compile(rule_set)?;
        let _guard = self.locks.lock(name).await;
        let mut sets = self.write();
        if sets.contains_key(name) && policy == SavePolicy::Reject {
            return Err(RuleError::RuleSetNameCollision(name.to_string()));
        }
        sets.insert(name.to_string(), rule_set.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_rule_set_name(name)?;
        let _guard = self.locks.lock(name).await;
        self.write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuleError::RuleSetNotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.read().keys().cloned().collect())
    }
}
