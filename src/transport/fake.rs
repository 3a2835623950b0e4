//! In-memory installation target for engine tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{BoxedTransport, TransportAdapter, TransportConnector};
use crate::errors::{RestoreError, Result};
use crate::utils::{ancestors_inclusive, parent_of};

#[derive(Debug, Default)]
pub struct FakeTarget {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Upload attempts per path, failed ones included.
    pub uploads: BTreeMap<String, usize>,
    pub mkdir_calls: Vec<String>,
    pub operations: usize,
    /// The connection silently dies once this many operations have run.
    pub drop_after: Option<usize>,
    pub connected: bool,
    pub connects: usize,
    /// Paths whose upload or mkdir fails with an item-level error.
    pub failing_paths: BTreeSet<String>,
    /// Paths whose upload fails with a connection-level error while the
    /// connection itself stays healthy.
    pub network_failing_paths: BTreeSet<String>,
    pub refuse_connections: bool,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub target: Arc<Mutex<FakeTarget>>,
}

impl FakeConnector {
    pub fn target(&self) -> std::sync::MutexGuard<'_, FakeTarget> {
        self.target.lock().unwrap()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self) -> Result<BoxedTransport> {
        let mut target = self.target.lock().unwrap();
        target.connects += 1;
        if target.refuse_connections {
            return Err(RestoreError::Network("connection refused".into()));
        }
        target.connected = true;
        Ok(Box::new(FakeTransport {
            target: Arc::clone(&self.target),
        }))
    }
}

struct FakeTransport {
    target: Arc<Mutex<FakeTarget>>,
}

impl FakeTarget {
    fn begin_operation(&mut self) -> Result<()> {
        if !self.connected {
            return Err(RestoreError::Network("connection reset by peer".into()));
        }
        self.operations += 1;
        if self.drop_after.is_some_and(|limit| self.operations >= limit) {
            self.drop_after = None;
            self.connected = false;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn health_check(&mut self) -> bool {
        self.target.lock().unwrap().connected
    }

    async fn ensure_directory(
        &mut self,
        rel: &str,
        _known: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let mut target = self.target.lock().unwrap();
        target.begin_operation()?;
        target.mkdir_calls.push(rel.to_string());
        if target.failing_paths.contains(rel) {
            return Err(RestoreError::Transport(format!("mkdir {} refused", rel)));
        }
        let made = ancestors_inclusive(rel);
        target.dirs.extend(made.iter().cloned());
        Ok(made)
    }

    async fn put_file(&mut self, source: &Path, rel: &str) -> Result<u64> {
        let mut target = self.target.lock().unwrap();
        target.begin_operation()?;
        *target.uploads.entry(rel.to_string()).or_default() += 1;
        if target.failing_paths.contains(rel) {
            return Err(RestoreError::Transport(format!("STOR {} refused", rel)));
        }
        if target.network_failing_paths.contains(rel) {
            return Err(RestoreError::Network(format!("STOR {}: 426 transfer aborted", rel)));
        }
        if let Some(parent) = parent_of(rel) {
            if !target.dirs.contains(&parent) {
                return Err(RestoreError::Transport(format!("{} has no parent directory", rel)));
            }
        }
        let content = std::fs::read(source)?;
        let len = content.len() as u64;
        target.files.insert(rel.to_string(), content);
        Ok(len)
    }

    async fn list_entries(&mut self, rel: &str) -> Result<Vec<String>> {
        let mut target = self.target.lock().unwrap();
        target.begin_operation()?;
        let prefix = if rel.is_empty() { String::new() } else { format!("{}/", rel) };
        Ok(target
            .files
            .keys()
            .chain(target.dirs.iter())
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn remove_file(&mut self, rel: &str) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        target.begin_operation()?;
        target.files.remove(rel);
        Ok(())
    }

    async fn remove_dir(&mut self, rel: &str) -> Result<()> {
        let mut target = self.target.lock().unwrap();
        target.begin_operation()?;
        target.dirs.remove(rel);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
