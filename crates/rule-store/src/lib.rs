//! Scope-partitioned rule storage.
//!
//! Each scope maps to one YAML document (`global.yaml`, `project.yaml`,
//! `individual.yaml`) under a configurable directory. Within the process a
//! per-document mutex serialises access to each file; across processes an OS
//! advisory lock is taken for the duration of each read or write (shared for
//! reads, exclusive for writes). The advisory lock covers single operations
//! only: a load-modify-save sequence such as [`RuleStore::add`] can still race
//! with a writer in another process.

#![deny(unsafe_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use fs2::FileExt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use warden_core::error::RuleError;
use warden_core::model::{Rule, RuleSet, Scope};
use warden_core::time::now_iso8601;

/// Storage abstraction over per-scope rule documents.
///
/// The file-backed implementation is [`YamlRuleStore`]; alternate backends
/// plug in behind this trait.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Load the ruleset for `scope`. A missing document yields an empty set.
    async fn load(&self, scope: Scope) -> Result<RuleSet, RuleError>;

    /// Overwrite the scope's document with `ruleset`, stamping `created_at`
    /// where missing and refreshing `updated_at` on every rule in the set.
    async fn save(&self, ruleset: RuleSet) -> Result<(), RuleError>;

    /// Find a rule by name, searching one scope or, when `scope` is `None`,
    /// all scopes in hierarchy order (first match wins).
    async fn get(&self, name: &str, scope: Option<Scope>) -> Result<Option<Rule>, RuleError>;

    /// Add a new rule to its scope. Fails if the name is already taken there.
    async fn add(&self, rule: Rule) -> Result<Rule, RuleError>;

    /// Replace an existing rule of the same name and scope, preserving its
    /// `created_at`.
    async fn update(&self, rule: Rule) -> Result<Rule, RuleError>;

    /// Remove a rule. Returns whether anything was removed.
    async fn delete(&self, name: &str, scope: Scope) -> Result<bool, RuleError>;

    /// Enumerate rules, scoped or across all scopes in hierarchy order.
    async fn list(&self, scope: Option<Scope>) -> Result<Vec<Rule>, RuleError>;

    /// Copy all existing scope documents into `dir`, re-parsed and
    /// re-serialised so the backup is normalised.
    async fn backup(&self, dir: &Path) -> Result<(), RuleError>;

    /// Restore scope documents found under `dir`, normalising on the way in.
    async fn restore(&self, dir: &Path) -> Result<(), RuleError>;

    /// Whether the storage directory is readable and writable.
    async fn health(&self) -> bool;
}

/// File-backed [`RuleStore`] keeping one YAML document per scope.
#[derive(Debug)]
pub struct YamlRuleStore {
    rules_dir: PathBuf,
    io_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    crud_locks: DashMap<Scope, Arc<Mutex<()>>>,
}

impl YamlRuleStore {
    /// Open a store rooted at `rules_dir`, creating the directory if needed.
    pub fn new(rules_dir: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let rules_dir = rules_dir.into();
        fs::create_dir_all(&rules_dir).map_err(|e| {
            RuleError::Unexpected(format!(
                "Failed to create rules directory {}: {e}",
                rules_dir.display()
            ))
        })?;
        Ok(Self { rules_dir, io_locks: DashMap::new(), crud_locks: DashMap::new() })
    }

    /// Directory this store reads and writes.
    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    fn doc_path(&self, scope: Scope) -> PathBuf {
        self.rules_dir.join(format!("{scope}.yaml"))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.io_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock held across a whole load-modify-save sequence so in-process CRUD
    /// on one scope document is serialised. Distinct from the I/O lock the
    /// sequence's individual load and save take underneath.
    fn crud_lock(&self, scope: Scope) -> Arc<Mutex<()>> {
        self.crud_locks
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read a document under the per-path mutex and a shared advisory lock.
    /// `Ok(None)` when the file does not exist.
    async fn read_document(&self, path: &Path) -> Result<Option<String>, RuleError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RuleError::Unexpected(format!(
                    "Failed to open {}: {e}",
                    path.display()
                )))
            }
        };
        file.lock_shared().map_err(|e| {
            RuleError::StorageLock(format!(
                "Failed to acquire read lock for {}: {e}",
                path.display()
            ))
        })?;
        let mut content = String::new();
        let read = file.read_to_string(&mut content);
        let _ = file.unlock();
        read.map_err(|e| {
            RuleError::Unexpected(format!("Failed to read {}: {e}", path.display()))
        })?;
        Ok(Some(content))
    }

    /// Write a document under the per-path mutex and an exclusive advisory
    /// lock. The file is only truncated after the lock is held.
    async fn write_document(&self, path: &Path, content: &str) -> Result<(), RuleError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                RuleError::Unexpected(format!("Failed to open {}: {e}", path.display()))
            })?;
        file.lock_exclusive().map_err(|e| {
            RuleError::StorageLock(format!(
                "Failed to acquire write lock for {}: {e}",
                path.display()
            ))
        })?;
        let write = file
            .set_len(0)
            .and_then(|()| file.write_all(content.as_bytes()))
            .and_then(|()| file.flush());
        let _ = file.unlock();
        write.map_err(|e| {
            RuleError::Unexpected(format!("Failed to write {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), bytes = content.len(), "wrote rule document");
        Ok(())
    }

    /// Parse/serialise cycle for backup and restore: the content passes
    /// through generic YAML, so formatting is normalised without re-stamping
    /// rule timestamps.
    async fn copy_normalised(&self, from: &Path, to: &Path) -> Result<(), RuleError> {
        let Some(content) = self.read_document(from).await? else {
            return Ok(());
        };
        let value: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
            RuleError::Unexpected(format!("Failed to parse {}: {e}", from.display()))
        })?;
        let normalised = serde_yaml::to_string(&value).map_err(|e| {
            RuleError::Unexpected(format!("Failed to serialise {}: {e}", from.display()))
        })?;
        self.write_document(to, &normalised).await
    }
}

#[async_trait]
impl RuleStore for YamlRuleStore {
    async fn load(&self, scope: Scope) -> Result<RuleSet, RuleError> {
        let path = self.doc_path(scope);
        let Some(content) = self.read_document(&path).await? else {
            return Ok(RuleSet::empty(scope));
        };
        if content.trim().is_empty() {
            return Ok(RuleSet::empty(scope));
        }
        let ruleset: RuleSet = serde_yaml::from_str(&content).map_err(|e| {
            RuleError::Unexpected(format!(
                "Failed to parse ruleset from {}: {e}",
                path.display()
            ))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    async fn save(&self, mut ruleset: RuleSet) -> Result<(), RuleError> {
        let now = now_iso8601();
        for rule in &mut ruleset.rules {
            if rule.created_at.is_none() {
                rule.created_at = Some(now.clone());
            }
            rule.updated_at = Some(now.clone());
        }
        let content = serde_yaml::to_string(&ruleset).map_err(|e| {
            RuleError::Unexpected(format!("Failed to serialise ruleset: {e}"))
        })?;
        self.write_document(&self.doc_path(ruleset.scope), &content).await
    }

    async fn get(&self, name: &str, scope: Option<Scope>) -> Result<Option<Rule>, RuleError> {
        let scopes: Vec<Scope> = match scope {
            Some(s) => vec![s],
            None => Scope::hierarchy().to_vec(),
        };
        for s in scopes {
            let ruleset = self.load(s).await?;
            if let Some(rule) = ruleset.rules.into_iter().find(|r| r.name == name) {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    async fn add(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        rule.validate()?;
        let crud = self.crud_lock(rule.scope);
        let _guard = crud.lock().await;
        let mut ruleset = self.load(rule.scope).await?;
        if ruleset.rules.iter().any(|r| r.name == rule.name) {
            return Err(RuleError::Unexpected(format!(
                "Rule {} already exists in scope {}",
                rule.name, rule.scope
            )));
        }
        let now = now_iso8601();
        rule.created_at = Some(now.clone());
        rule.updated_at = Some(now);
        ruleset.rules.push(rule.clone());
        self.save(ruleset).await?;
        Ok(rule)
    }

    async fn update(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        rule.validate()?;
        let crud = self.crud_lock(rule.scope);
        let _guard = crud.lock().await;
        let mut ruleset = self.load(rule.scope).await?;
        let Some(slot) = ruleset.rules.iter_mut().find(|r| r.name == rule.name) else {
            return Err(RuleError::RuleNotFound { name: rule.name });
        };
        rule.created_at = slot.created_at.clone();
        rule.updated_at = Some(now_iso8601());
        *slot = rule.clone();
        self.save(ruleset).await?;
        Ok(rule)
    }

    async fn delete(&self, name: &str, scope: Scope) -> Result<bool, RuleError> {
        let crud = self.crud_lock(scope);
        let _guard = crud.lock().await;
        let mut ruleset = self.load(scope).await?;
        let before = ruleset.rules.len();
        ruleset.rules.retain(|r| r.name != name);
        if ruleset.rules.len() == before {
            return Ok(false);
        }
        self.save(ruleset).await?;
        Ok(true)
    }

    async fn list(&self, scope: Option<Scope>) -> Result<Vec<Rule>, RuleError> {
        let scopes: Vec<Scope> = match scope {
            Some(s) => vec![s],
            None => Scope::hierarchy().to_vec(),
        };
        let mut rules = Vec::new();
        for s in scopes {
            rules.extend(self.load(s).await?.rules);
        }
        Ok(rules)
    }

    async fn backup(&self, dir: &Path) -> Result<(), RuleError> {
        fs::create_dir_all(dir).map_err(|e| {
            RuleError::Unexpected(format!(
                "Failed to create backup directory {}: {e}",
                dir.display()
            ))
        })?;
        for scope in Scope::hierarchy() {
            let source = self.doc_path(scope);
            let dest = dir.join(format!("{scope}.yaml"));
            self.copy_normalised(&source, &dest).await?;
        }
        Ok(())
    }

    async fn restore(&self, dir: &Path) -> Result<(), RuleError> {
        for scope in Scope::hierarchy() {
            let source = dir.join(format!("{scope}.yaml"));
            let dest = self.doc_path(scope);
            self.copy_normalised(&source, &dest).await?;
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        let probe = self.rules_dir.join(".health_check");
        match fs::write(&probe, b"health_check") {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&probe) {
                    warn!(probe = %probe.display(), error = %e, "health probe left behind");
                }
                true
            }
            Err(e) => {
                warn!(dir = %self.rules_dir.display(), error = %e, "storage health probe failed");
                false
            }
        }
    }
}
