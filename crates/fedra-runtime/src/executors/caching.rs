//! Memoizes `create_value` by content fingerprint.
//!
//! A request starts its child call on a spawned task and returns at once
//! with a pending handle. Identical requests made while any handle to the
//! entry is alive share that call. A failed child call evicts its entry, and
//! dropping the last handle aborts a call still in flight.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use fedra_core::{Selector, Type, Value};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::executor::{
    Executor, ExecutorId, ExecutorValue, Fingerprint, Payload, SharedExecutor, ValueRef,
};

type Table = Mutex<HashMap<Fingerprint, (u64, Weak<CacheEntry>)>>;
type Target = Shared<BoxFuture<'static, Result<ValueRef>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<Fingerprint, (u64, Weak<CacheEntry>)>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn evict(table: &Weak<Table>, key: &Fingerprint, entry_id: u64) {
    if let Some(table) = table.upgrade() {
        let mut table = lock(&table);
        if table.get(key).map(|(id, _)| *id) == Some(entry_id) {
            table.remove(key);
        }
    }
}

struct CacheEntry {
    target: Target,
    abort: Option<AbortHandle>,
    key: Option<(Fingerprint, u64)>,
    table: Weak<Table>,
    computed: OnceCell<Value>,
}

impl CacheEntry {
    fn ready(handle: ValueRef) -> Self {
        Self {
            target: future::ready(Ok(handle)).boxed().shared(),
            abort: None,
            key: None,
            table: Weak::new(),
            computed: OnceCell::new(),
        }
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        if let Some((key, id)) = &self.key {
            evict(&self.table, key, *id);
        }
    }
}

struct CachedValue {
    ty: Type,
    entry: Arc<CacheEntry>,
}

impl ExecutorValue for CachedValue {
    fn type_signature(&self) -> &Type {
        &self.ty
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CachingExecutor {
    id: ExecutorId,
    child: SharedExecutor,
    table: Arc<Table>,
    next_entry: AtomicU64,
}

impl CachingExecutor {
    pub fn new(child: SharedExecutor) -> Self {
        Self {
            id: ExecutorId::next(),
            child,
            table: Arc::new(Mutex::new(HashMap::new())),
            next_entry: AtomicU64::new(0),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock(&self.table)
            .values()
            .filter(|(_, w)| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wrap(&self, ty: Type, entry: Arc<CacheEntry>) -> ValueRef {
        ValueRef::new(self.id, CachedValue { ty, entry })
    }

    fn entry<'a>(&self, h: &'a ValueRef) -> Result<&'a Arc<CacheEntry>> {
        Ok(&h.downcast::<CachedValue>(self.id)?.entry)
    }

    /// Wait for the child handle behind `h`.
    async fn target(&self, h: &ValueRef) -> Result<ValueRef> {
        self.entry(h)?.target.clone().await
    }

    fn lookup_or_start(&self, key: Fingerprint, payload: Payload, ty: Type) -> ValueRef {
        let mut table = lock(&self.table);
        if let Some(entry) = table.get(&key).and_then(|(_, w)| w.upgrade()) {
            debug!(key = ?key, "cache hit");
            return self.wrap(ty, entry);
        }

        let entry_id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let child = self.child.clone();
        let weak_table = Arc::downgrade(&self.table);
        let task_key = key.clone();
        let task_ty = ty.clone();
        let task = tokio::spawn(async move {
            let result = child.create_value(payload, task_ty).await;
            if let Err(e) = &result {
                debug!(error = %e, "evicting failed cache entry");
                evict(&weak_table, &task_key, entry_id);
            }
            result
        });
        let abort = task.abort_handle();
        let target = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ExecutorError::Cancelled),
                Err(e) => Err(ExecutorError::Evaluation(format!("child call panicked: {e}"))),
            }
        }
        .boxed()
        .shared();

        let entry = Arc::new(CacheEntry {
            target,
            abort: Some(abort),
            key: Some((key.clone(), entry_id)),
            table: Arc::downgrade(&self.table),
            computed: OnceCell::new(),
        });
        table.insert(key, (entry_id, Arc::downgrade(&entry)));
        self.wrap(ty, entry)
    }
}

#[async_trait]
impl Executor for CachingExecutor {
    async fn create_value(&self, payload: Payload, ty: Type) -> Result<ValueRef> {
        let key = Fingerprint::of(&payload, &ty)?;
        Ok(self.lookup_or_start(key, payload, ty))
    }

    async fn create_call(
        &self,
        function: &ValueRef,
        argument: Option<&ValueRef>,
    ) -> Result<ValueRef> {
        let f = self.target(function).await?;
        let a = match argument {
            Some(a) => Some(self.target(a).await?),
            None => None,
        };
        let out = self.child.create_call(&f, a.as_ref()).await?;
        let ty = out.type_signature().clone();
        Ok(self.wrap(ty, Arc::new(CacheEntry::ready(out))))
    }

    async fn create_struct(&self, elements: Vec<(Option<String>, ValueRef)>) -> Result<ValueRef> {
        let mut inner = Vec::with_capacity(elements.len());
        for (name, h) in &elements {
            inner.push((name.clone(), self.target(h).await?));
        }
        let out = self.child.create_struct(inner).await?;
        let ty = out.type_signature().clone();
        Ok(self.wrap(ty, Arc::new(CacheEntry::ready(out))))
    }

    async fn create_selection(&self, source: &ValueRef, selector: Selector) -> Result<ValueRef> {
        let s = self.target(source).await?;
        let out = self.child.create_selection(&s, selector).await?;
        let ty = out.type_signature().clone();
        Ok(self.wrap(ty, Arc::new(CacheEntry::ready(out))))
    }

    async fn compute(&self, value: &ValueRef) -> Result<Value> {
        let entry = self.entry(value)?;
        entry
            .computed
            .get_or_try_init(|| async {
                let target = entry.target.clone().await?;
                self.child.compute(&target).await
            })
            .await
            .cloned()
    }

    async fn close(&self) {
        self.child.close().await;
    }
}
