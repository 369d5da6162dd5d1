// Reference-counted pool of open workspaces. One live instance per id;
// the last reference out tears the workspace down.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use super::Workspace;

struct PoolEntry {
    workspace: Arc<Workspace>,
    refs: usize,
}

struct PoolInner {
    entries: Mutex<HashMap<Uuid, PoolEntry>>,
}

/// Shares open workspaces between callers.
///
/// Lookup-and-increment, insert, and decrement-and-evict each run as one
/// uninterrupted unit under the pool lock, so concurrent callers for the
/// same id always converge on a single live instance.
#[derive(Clone)]
pub struct WorkspacePool {
    inner: Arc<PoolInner>,
}

impl WorkspacePool {
    pub fn new() -> Self {
        Self { inner: Arc::new(PoolInner { entries: Mutex::new(HashMap::new()) }) }
    }

    /// Borrow an already-open workspace, if any.
    pub fn get(&self, id: Uuid) -> Option<WorkspaceRef> {
        let mut entries =
            self.inner.entries.lock().expect("workspace pool lock should not be poisoned");
        let entry = entries.get_mut(&id)?;
        entry.refs += 1;
        Some(WorkspaceRef {
            workspace: Arc::clone(&entry.workspace),
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Register a freshly opened workspace with one outstanding reference.
    /// A previous entry under the same id is evicted and torn down; its
    /// outstanding references keep working against the old instance but no
    /// longer count toward the pool.
    pub fn put(&self, workspace: Workspace) -> WorkspaceRef {
        let id = workspace.id();
        let workspace = Arc::new(workspace);
        let previous = {
            let mut entries =
                self.inner.entries.lock().expect("workspace pool lock should not be poisoned");
            entries
                .insert(id, PoolEntry { workspace: Arc::clone(&workspace), refs: 1 })
                .map(|entry| entry.workspace)
        };
        if let Some(previous) = previous {
            debug!(workspace = %id, "replacing pooled workspace; closing the previous instance");
            previous.close();
        }
        WorkspaceRef { workspace, inner: Arc::clone(&self.inner), id }
    }

    /// Borrow the pooled workspace for `id`, opening it with `open` when
    /// absent. The pool lock is held across `open`, so racing callers for
    /// the same id trigger exactly one open between them.
    pub fn get_or_open(
        &self,
        id: Uuid,
        open: impl FnOnce() -> Result<Workspace>,
    ) -> Result<WorkspaceRef> {
        let mut entries =
            self.inner.entries.lock().expect("workspace pool lock should not be poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            entry.refs += 1;
            return Ok(WorkspaceRef {
                workspace: Arc::clone(&entry.workspace),
                inner: Arc::clone(&self.inner),
                id,
            });
        }

        let workspace = Arc::new(open()?);
        entries.insert(id, PoolEntry { workspace: Arc::clone(&workspace), refs: 1 });
        Ok(WorkspaceRef { workspace, inner: Arc::clone(&self.inner), id })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner
            .entries
            .lock()
            .expect("workspace pool lock should not be poisoned")
            .contains_key(&id)
    }

    pub fn ref_count(&self, id: Uuid) -> usize {
        self.inner
            .entries
            .lock()
            .expect("workspace pool lock should not be poisoned")
            .get(&id)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("workspace pool lock should not be poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkspacePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A counted borrow of a pooled workspace. Dropping it releases the
/// reference; the drop that takes the count to zero evicts the entry and
/// closes the workspace. Teardown never panics or propagates errors.
pub struct WorkspaceRef {
    workspace: Arc<Workspace>,
    inner: Arc<PoolInner>,
    id: Uuid,
}

impl std::fmt::Debug for WorkspaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRef").field("id", &self.id).finish_non_exhaustive()
    }
}

impl WorkspaceRef {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Deref for WorkspaceRef {
    type Target = Workspace;

    fn deref(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceRef {
    fn drop(&mut self) {
        let to_close = {
            let mut entries =
                self.inner.entries.lock().expect("workspace pool lock should not be poisoned");
            match entries.get_mut(&self.id) {
                // Only decrement the entry this reference was minted against;
                // after a `put` replacement the slot belongs to the new instance.
                Some(entry) if Arc::ptr_eq(&entry.workspace, &self.workspace) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        entries.remove(&self.id).map(|entry| entry.workspace)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        // Closing happens outside the pool lock. The workspace logs its own
        // teardown failures.
        if let Some(workspace) = to_close {
            debug!(workspace = %self.id, "last reference released; closing workspace");
            workspace.close();
        }
    }
}
