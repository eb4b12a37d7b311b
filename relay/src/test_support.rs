//! Test-only fakes for the resource and executor seams.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::core::types::{Location, Snapshot, Version};
use crate::core::version::git_blob_version;
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::resource::{ResourceError, VersionedResource};

#[derive(Debug, Default)]
struct MemoryState {
    body: String,
    version: Option<Version>,
    reads: u32,
    writes: u32,
    read_faults: VecDeque<ResourceError>,
    write_faults: VecDeque<ResourceError>,
    commit_messages: Vec<String>,
}

/// In-memory resource with real compare-and-swap semantics.
///
/// Versions are git blob ids, like the hosted resource. Clones share state, so
/// a controller and an agent in different threads see the same document.
#[derive(Debug, Clone, Default)]
pub struct MemoryResource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryResource {
    pub fn new(body: &str) -> Self {
        let resource = Self::default();
        {
            let mut state = resource.lock();
            state.body = body.to_string();
            state.version = Some(git_blob_version(body));
        }
        resource
    }

    /// Start from a fixed version label instead of a content hash.
    pub fn with_version(body: &str, version: &str) -> Self {
        let resource = Self::new(body);
        resource.lock().version = Some(Version::from(version));
        resource
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn body(&self) -> String {
        self.lock().body.clone()
    }

    pub fn version(&self) -> Version {
        self.lock()
            .version
            .clone()
            .unwrap_or_else(|| git_blob_version(""))
    }

    pub fn reads(&self) -> u32 {
        self.lock().reads
    }

    pub fn writes(&self) -> u32 {
        self.lock().writes
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.lock().commit_messages.clone()
    }

    /// Replace the body out of band, as a third-party writer would.
    pub fn overwrite(&self, body: &str) -> Version {
        let mut state = self.lock();
        state.body = body.to_string();
        let version = git_blob_version(body);
        state.version = Some(version.clone());
        version
    }

    /// Fail the next read with `err`.
    pub fn fail_next_read(&self, err: ResourceError) {
        self.lock().read_faults.push_back(err);
    }

    /// Fail the next write with `err`, before the version check.
    pub fn fail_next_write(&self, err: ResourceError) {
        self.lock().write_faults.push_back(err);
    }
}

impl VersionedResource for MemoryResource {
    fn read(&self, _location: &Location) -> Result<Snapshot, ResourceError> {
        let mut state = self.lock();
        state.reads += 1;
        if let Some(err) = state.read_faults.pop_front() {
            return Err(err);
        }
        Ok(Snapshot {
            version: state
                .version
                .clone()
                .unwrap_or_else(|| git_blob_version("")),
            body: state.body.clone(),
        })
    }

    fn write(
        &self,
        _location: &Location,
        body: &str,
        expected: &Version,
        message: &str,
    ) -> Result<Version, ResourceError> {
        let mut state = self.lock();
        if let Some(err) = state.write_faults.pop_front() {
            return Err(err);
        }
        let current = state
            .version
            .clone()
            .unwrap_or_else(|| git_blob_version(""));
        if current != *expected {
            return Err(ResourceError::VersionConflict {
                expected: expected.clone(),
                current: Some(current),
            });
        }
        let next = git_blob_version(body);
        state.body = body.to_string();
        state.version = Some(next.clone());
        state.writes += 1;
        state.commit_messages.push(message.to_string());
        Ok(next)
    }
}

/// Executor returning canned output per directive and recording what it ran.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    outputs: HashMap<String, String>,
    ran: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new<I, K, V>(outputs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            outputs: outputs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ran: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.ran
            .lock()
            .map_err(|_| anyhow!("scripted executor poisoned"))?
            .push(request.directive.clone());
        let text = self
            .outputs
            .get(&request.directive)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted output for {:?}", request.directive))?;
        Ok(ExecOutput {
            text,
            exit_code: Some(0),
            timed_out: false,
        })
    }
}
