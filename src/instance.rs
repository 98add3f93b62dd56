//! Ambient, project-scoped execution scope.
//!
//! `Instance::provide` installs a scope that is visible to everything called
//! from inside its future without being threaded through every signature,
//! mirroring the task-local execution-context idiom this codebase already
//! uses for per-call-chain state. `state(factory)` memoizes one value per
//! resource type per scope; `dispose()` tears those values down in reverse
//! registration order.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::error::{CoreError, CoreResult};

type AnyArc = Arc<dyn Any + Send + Sync>;

/// A boxed async teardown action registered alongside a memoized state slot.
pub type Teardown = Pin<Box<dyn Future<Output = ()> + Send>>;

tokio::task_local! {
    static CURRENT: Arc<Instance>;
}

/// A VCS-rooted project descriptor.
#[derive(Debug, Clone)]
pub struct Project {
    /// Stable identifier: the hash of the repository's root commit, or the
    /// sentinel `"global"` when `directory` is not inside a git worktree.
    pub id: String,
    pub vcs: Option<String>,
    pub worktree: PathBuf,
    pub time: ProjectTime,
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectTime {
    pub created: i64,
    pub initialized: Option<i64>,
}

const GLOBAL_PROJECT_ID: &str = "global";

/// Resolve the stable project id for `directory` by walking to the
/// repository root and hashing its root commit. Falls back to the
/// `"global"` sentinel when `directory` is not inside a git worktree.
#[instrument(skip_all, fields(directory = %directory.display()))]
fn resolve_project(directory: &Path) -> Project {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    match discover_root_commit(directory) {
        Some((worktree, root_commit)) => Project {
            id: root_commit,
            vcs: Some("git".to_string()),
            worktree,
            time: ProjectTime {
                created: now,
                initialized: Some(now),
            },
        },
        None => Project {
            id: GLOBAL_PROJECT_ID.to_string(),
            vcs: None,
            worktree: directory.to_path_buf(),
            time: ProjectTime {
                created: now,
                initialized: None,
            },
        },
    }
}

fn discover_root_commit(directory: &Path) -> Option<(PathBuf, String)> {
    let repo = gix::discover(directory).ok()?;
    let worktree = repo.workdir().map(Path::to_path_buf).unwrap_or_else(|| directory.to_path_buf());
    let head = repo.head_commit().ok()?;
    let mut current = head;
    loop {
        let parents: Vec<_> = current.parent_ids().collect();
        match parents.first() {
            Some(parent_id) => {
                current = parent_id.object().ok()?.try_into_commit().ok()?;
            }
            None => break,
        }
    }
    Some((worktree, current.id().to_string()))
}

struct Slot {
    cell: Arc<OnceCell<AnyArc>>,
}

/// A running, project-scoped execution scope.
pub struct Instance {
    pub directory: PathBuf,
    project: Project,
    slots: Mutex<HashMap<TypeId, Slot>>,
    disposers: Mutex<Vec<Teardown>>,
    disposed: std::sync::atomic::AtomicBool,
}

impl Instance {
    fn new(directory: PathBuf) -> Self {
        let project = resolve_project(&directory);
        Self {
            directory,
            project,
            slots: Mutex::new(HashMap::new()),
            disposers: Mutex::new(Vec::new()),
            disposed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Run `f` inside a freshly constructed scope bound to `directory`.
    /// Nested calls shadow rather than merge with any enclosing scope.
    #[instrument(skip_all, fields(directory = %directory.display()))]
    pub async fn provide<F, Fut, R>(directory: impl Into<PathBuf>, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let instance = Arc::new(Instance::new(directory.into()));
        CURRENT.scope(instance, f()).await
    }

    /// The scope active for the current call chain, if any.
    pub fn current() -> CoreResult<Arc<Instance>> {
        CURRENT
            .try_with(|instance| instance.clone())
            .map_err(|_| CoreError::ScopeDisposed)
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Memoizing accessor: the first caller for a given `T` in this scope
    /// runs `factory`; concurrent and later callers observe the same
    /// in-flight or completed result.
    #[instrument(skip_all)]
    pub async fn state<T, F, Fut>(&self, factory: F) -> CoreResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.state_disposable(factory, |_| None).await
    }

    /// Like [`state`](Self::state), but `teardown` is invoked (in reverse
    /// registration order, alongside every other registered teardown) when
    /// the scope is disposed. `teardown` is only consulted the first time
    /// the slot is successfully populated.
    pub async fn state_disposable<T, F, Fut>(
        &self,
        factory: F,
        teardown: impl FnOnce(Arc<T>) -> Option<Teardown>,
    ) -> CoreResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if self.disposed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(CoreError::ScopeDisposed);
        }

        let type_id = TypeId::of::<T>();
        let cell = {
            let mut slots = self.slots.lock();
            slots
                .entry(type_id)
                .or_insert_with(|| Slot {
                    cell: Arc::new(OnceCell::new()),
                })
                .cell
                .clone()
        };

        let any = cell
            .get_or_try_init(|| async {
                let value = factory().await?;
                let arc: AnyArc = Arc::new(value);
                Ok::<AnyArc, CoreError>(arc)
            })
            .await?;

        let value = any
            .clone()
            .downcast::<T>()
            .expect("state slot type mismatch for TypeId");

        if let Some(fut) = teardown(value.clone()) {
            self.disposers.lock().push(fut);
        }

        Ok(value)
    }

    /// Tear down every registered disposer, in reverse registration order,
    /// and mark the scope disposed. Any subsequent `state`/`state_disposable`
    /// call on this instance returns [`CoreError::ScopeDisposed`] rather
    /// than silently repopulating a slot.
    #[instrument(skip_all)]
    pub async fn dispose(&self) {
        self.disposed.store(true, std::sync::atomic::Ordering::Release);
        let disposers = std::mem::take(&mut *self.disposers.lock());
        for teardown in disposers.into_iter().rev() {
            teardown.await;
        }
        self.slots.lock().clear();
    }
}
