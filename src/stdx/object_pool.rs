//! Bounded lock-free object pool with per-thread caches.
//!
//! # Design
//!
//! - **Preallocated blocks**: records are allocated upfront in contiguous
//!   blocks and recycled for the pool's lifetime, zero alloc per acquire on
//!   the hot path
//! - **Per-thread caches**: each registered thread owns a small singly linked
//!   stack of free records; cache operations are plain loads/stores
//! - **Global free list**: a Treiber stack shared by all threads, CAS on the
//!   head only
//! - **Optional expansion**: when every reserve is empty, a single record is
//!   allocated on demand, bounded by `max_total_objects`
//! - **RAII handles**: [`Pooled`] returns its record on drop; the releasing
//!   thread need not be the acquiring thread
//!
//! # Registration protocol
//!
//! Every thread that acquires or releases MUST hold a [`PoolThreadGuard`]
//! obtained from [`ObjectPool::register_thread`]. The guard owns the thread's
//! cache and drains it into the global free list on drop. Using the pool from
//! an unregistered thread is a programming error: debug builds assert;
//! release builds fall back to the global free list so behavior stays
//! defined.
//!
//! # Memory ordering contract
//!
//! | Operation            | Ordering                                   |
//! |----------------------|--------------------------------------------|
//! | global push          | release on successful CAS                  |
//! | global pop           | acquire on successful CAS                  |
//! | `node.next` via pop  | relaxed (only the winning popper derefs)   |
//! | thread cache ops     | plain (single-thread access)               |
//! | shutdown wait        | condvar guarded by the registration mutex  |
//!
//! # ABA
//!
//! The global list is a Treiber stack. A popped record always transitions to
//! the in-use state (its slot is written) before any re-push, and releases
//! land in the per-thread cache first, so two pushes of the same node never
//! interleave without an intervening content change. Record deallocation
//! (scavenger trim, final drop) only happens while the registration lock is
//! held and no thread is registered.

use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::sync::Unparker;
use crossbeam_utils::CachePadded;

// ============================================================================
// Configuration
// ============================================================================

/// Object pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Records allocated upfront in a contiguous block.
    pub prealloc: usize,

    /// Per-thread cache capacity. Releases beyond this overflow to the
    /// global free list. Zero disables caching.
    pub max_thread_cache: usize,

    /// Allow allocating individual records once every reserve is empty.
    pub dynamic_expansion: bool,

    /// Hard cap on live + free records, counting preallocated ones.
    pub max_total_objects: usize,
}

impl PoolConfig {
    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.prealloc > 0, "prealloc must be > 0");
        assert!(
            self.max_total_objects >= self.prealloc,
            "max_total_objects must cover the preallocated records"
        );
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prealloc: 1024,
            max_thread_cache: 32,
            dynamic_expansion: true,
            max_total_objects: usize::MAX,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to hand out a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AcquireError {
    /// Caches and the global list are empty and expansion is disabled,
    /// capped, or refused by the allocator.
    Exhausted,
    /// The pool is shutting down. Debug builds assert before returning this.
    ShuttingDown,
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "object pool exhausted"),
            Self::ShuttingDown => write!(f, "object pool is shutting down"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Failure from [`ObjectPool::acquire_with`]: either the pool refused a
/// record, or the caller's constructor failed (the record is returned to the
/// global free list).
#[derive(Debug)]
pub enum AcquireWithError<E> {
    Pool(AcquireError),
    Init(E),
}

impl<E: fmt::Display> fmt::Display for AcquireWithError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(e) => write!(f, "{e}"),
            Self::Init(e) => write!(f, "record constructor failed: {e}"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for AcquireWithError<E> {}

// ============================================================================
// Internals
// ============================================================================

/// A storage slot plus the free-list link word.
///
/// Free: `next` participates in a cache or the global list, `slot` is
/// uninitialized. In-use: `slot` holds a constructed `T`, `next` is
/// irrelevant.
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    slot: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Per-thread cache entry. Lives in [`THREAD_CACHES`], keyed by pool id; the
/// head pointer is type-erased because one TLS slot serves pools of every
/// element type.
struct CacheSlot {
    head: *mut (),
    len: usize,
}

thread_local! {
    /// One TLS slot holding this thread's cache for every pool it registered
    /// with. Entries are created by `register_thread` and removed when the
    /// guard drops.
    static THREAD_CACHES: RefCell<HashMap<u64, CacheSlot>> =
        RefCell::new(HashMap::new());
}

/// Pool ids are process-unique and never reused, so a stale TLS entry can
/// never alias a new pool.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Scavenger {
    stop: Arc<AtomicBool>,
    unparker: Unparker,
    handle: JoinHandle<()>,
}

struct Inner<T> {
    /// Treiber stack head.
    free: CachePadded<AtomicPtr<Node<T>>>,
    /// Live + free records, preallocated ones included.
    total: AtomicUsize,
    /// Registered thread count; shutdown blocks until it reaches zero.
    active_threads: AtomicUsize,
    shutting_down: AtomicBool,
    /// Serializes registration, unregistration, unregistered-thread releases,
    /// and record deallocation. Never taken on the registered hot path.
    reg_lock: Mutex<()>,
    shutdown_cv: Condvar,
    scavenger: Mutex<Option<Scavenger>>,
    /// Preallocated blocks; records inside are never freed individually.
    blocks: Vec<Box<[Node<T>]>>,
    cfg: PoolConfig,
    reset_hook: Option<fn(&mut T)>,
    pool_id: u64,
}

// SAFETY: records are handed between threads by move; the global list is
// CAS-managed; thread caches are only touched by their owner thread.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

enum CachePush {
    Cached,
    Overflow,
    NotRegistered,
}

impl<T> Inner<T> {
    fn slot_ptr(node: NonNull<Node<T>>) -> *mut T {
        unsafe { node.as_ref().slot.get().cast::<T>() }
    }

    #[cfg(debug_assertions)]
    fn thread_registered(&self) -> bool {
        THREAD_CACHES.with(|caches| caches.borrow().contains_key(&self.pool_id))
    }

    fn take_node(&self) -> Result<NonNull<Node<T>>, AcquireError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            debug_assert!(false, "acquire after pool shutdown");
            return Err(AcquireError::ShuttingDown);
        }
        #[cfg(debug_assertions)]
        debug_assert!(
            self.thread_registered(),
            "pool used by a thread that never registered"
        );

        if let Some(node) = self.pop_cache() {
            return Ok(node);
        }
        if let Some(node) = self.pop_global() {
            return Ok(node);
        }
        if self.cfg.dynamic_expansion {
            self.expand()
        } else {
            Err(AcquireError::Exhausted)
        }
    }

    fn pop_cache(&self) -> Option<NonNull<Node<T>>> {
        THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            let slot = caches.get_mut(&self.pool_id)?;
            let head = NonNull::new(slot.head as *mut Node<T>)?;
            // Plain access: this cache belongs to the current thread.
            let next = unsafe { head.as_ref().next.load(Ordering::Relaxed) };
            slot.head = next as *mut ();
            slot.len -= 1;
            Some(head)
        })
    }

    fn pop_global(&self) -> Option<NonNull<Node<T>>> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            let head_ptr = NonNull::new(head)?;
            // Relaxed is enough here: only the winning popper reaches into
            // the node, and the successful CAS below carries acquire.
            let next = unsafe { head_ptr.as_ref().next.load(Ordering::Relaxed) };
            match self.free.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head_ptr),
                Err(actual) => head = actual,
            }
        }
    }

    fn push_global(&self, node: NonNull<Node<T>>) {
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            unsafe { node.as_ref().next.store(head, Ordering::Relaxed) };
            match self.free.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn expand(&self) -> Result<NonNull<Node<T>>, AcquireError> {
        let mut total = self.total.load(Ordering::Relaxed);
        loop {
            if total >= self.cfg.max_total_objects {
                return Err(AcquireError::Exhausted);
            }
            match self.total.compare_exchange_weak(
                total,
                total + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => total = actual,
            }
        }
        let raw = Box::into_raw(Box::new(Node::empty()));
        // SAFETY: Box::into_raw never returns null.
        Ok(unsafe { NonNull::new_unchecked(raw) })
    }

    /// Release path: reset hook, destroy in place, then cache or overflow.
    ///
    /// # Safety
    ///
    /// `node` must hold a constructed `T` and be exclusively owned by the
    /// caller.
    unsafe fn release_node(&self, node: NonNull<Node<T>>) {
        let obj = Self::slot_ptr(node);
        if let Some(hook) = self.reset_hook {
            hook(unsafe { &mut *obj });
        }
        unsafe { ptr::drop_in_place(obj) };

        let outcome = THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            match caches.get_mut(&self.pool_id) {
                Some(slot) if slot.len < self.cfg.max_thread_cache => {
                    unsafe {
                        node.as_ref()
                            .next
                            .store(slot.head as *mut Node<T>, Ordering::Relaxed);
                    }
                    slot.head = node.as_ptr() as *mut ();
                    slot.len += 1;
                    CachePush::Cached
                }
                Some(_) => CachePush::Overflow,
                None => CachePush::NotRegistered,
            }
        });
        match outcome {
            CachePush::Cached => {}
            CachePush::Overflow => self.push_global(node),
            CachePush::NotRegistered => {
                debug_assert!(false, "record released from an unregistered thread");
                // Defined fallback: serialize with trim/registration, then
                // hand the record to the global list.
                let _guard = self
                    .reg_lock
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                self.push_global(node);
            }
        }
    }

    fn is_preallocated(&self, node: NonNull<Node<T>>) -> bool {
        let addr = node.as_ptr() as usize;
        self.blocks.iter().any(|block| {
            let start = block.as_ptr() as usize;
            let end = start + block.len() * std::mem::size_of::<Node<T>>();
            addr >= start && addr < end
        })
    }

    /// Deallocate overflow records sitting on the global free list.
    ///
    /// Runs only while no thread is registered; the registration lock keeps
    /// it mutually exclusive with registration and unregistered releases, so
    /// the list is private to this call.
    fn trim_overflow(&self) {
        let _guard = self
            .reg_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.active_threads.load(Ordering::Acquire) != 0 {
            return;
        }
        let mut node = self.free.swap(ptr::null_mut(), Ordering::Acquire);
        while let Some(n) = NonNull::new(node) {
            node = unsafe { n.as_ref().next.load(Ordering::Relaxed) };
            if self.is_preallocated(n) {
                self.push_global(n);
            } else {
                unsafe { drop(Box::from_raw(n.as_ptr())) };
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Every live handle and guard holds the pool alive, so by now all
        // records are free and every cache has been drained.
        let mut free_count = 0usize;
        let mut node = *self.free.get_mut();
        while let Some(n) = NonNull::new(node) {
            node = unsafe { n.as_ref().next.load(Ordering::Relaxed) };
            free_count += 1;
            if !self.is_preallocated(n) {
                unsafe { drop(Box::from_raw(n.as_ptr())) };
            }
        }
        assert!(
            free_count == self.total.load(Ordering::Relaxed),
            "object pool dropped with {free_count} free of {} total records",
            self.total.load(Ordering::Relaxed)
        );
        // Preallocated blocks are released when `blocks` drops.
    }
}

// ============================================================================
// ObjectPool
// ============================================================================

/// Cloneable handle to a shared object pool.
///
/// All clones operate on the same record inventory. The backing storage is
/// released when the last handle, guard, and [`Pooled`] record are gone.
pub struct ObjectPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ObjectPool<T> {
    /// Create a pool without a reset hook.
    pub fn new(cfg: PoolConfig) -> Self {
        Self::with_reset(cfg, None)
    }

    /// Create a pool. `reset_hook`, if any, runs on every release before the
    /// record's `T` is destroyed.
    pub fn with_reset(cfg: PoolConfig, reset_hook: Option<fn(&mut T)>) -> Self {
        cfg.validate();

        let block: Box<[Node<T>]> = (0..cfg.prealloc).map(|_| Node::empty()).collect();

        // Thread the block into the initial free list. Relaxed stores are
        // fine: the pool is not shared until construction returns.
        let mut head: *mut Node<T> = ptr::null_mut();
        for node in block.iter().rev() {
            node.next.store(head, Ordering::Relaxed);
            head = node as *const Node<T> as *mut Node<T>;
        }

        Self {
            inner: Arc::new(Inner {
                free: CachePadded::new(AtomicPtr::new(head)),
                total: AtomicUsize::new(cfg.prealloc),
                active_threads: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                reg_lock: Mutex::new(()),
                shutdown_cv: Condvar::new(),
                scavenger: Mutex::new(None),
                blocks: vec![block],
                cfg,
                reset_hook,
                pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Register the calling thread and hand back the guard that owns its
    /// cache. The guard drains the cache into the global free list on drop.
    ///
    /// # Panics
    ///
    /// Panics on double registration or registration after shutdown began.
    pub fn register_thread(&self) -> PoolThreadGuard<T> {
        let inner = &self.inner;
        let _guard = inner.reg_lock.lock().expect("registration mutex poisoned");
        assert!(
            !inner.shutting_down.load(Ordering::Relaxed),
            "thread registered after pool shutdown"
        );
        THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            assert!(
                !caches.contains_key(&inner.pool_id),
                "thread double-registered with object pool"
            );
            caches.insert(
                inner.pool_id,
                CacheSlot {
                    head: ptr::null_mut(),
                    len: 0,
                },
            );
        });
        inner.active_threads.fetch_add(1, Ordering::AcqRel);
        PoolThreadGuard {
            pool: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// Hand out a record constructed from `value`.
    pub fn acquire(&self, value: T) -> Result<Pooled<T>, AcquireError> {
        let node = self.inner.take_node()?;
        unsafe { Inner::slot_ptr(node).write(value) };
        Ok(Pooled {
            node,
            pool: self.clone(),
        })
    }

    /// Hand out a record constructed by `init`. If `init` fails the record
    /// returns to the global free list and the error propagates.
    pub fn acquire_with<E>(
        &self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<Pooled<T>, AcquireWithError<E>> {
        let node = self.inner.take_node().map_err(AcquireWithError::Pool)?;
        match init() {
            Ok(value) => {
                unsafe { Inner::slot_ptr(node).write(value) };
                Ok(Pooled {
                    node,
                    pool: self.clone(),
                })
            }
            Err(err) => {
                self.inner.push_global(node);
                Err(AcquireWithError::Init(err))
            }
        }
    }

    /// Live + free records currently owned by the pool.
    ///
    /// Snapshot; may be stale as soon as it returns.
    pub fn total_records(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Begin shutdown: refuse further acquires, block until every registered
    /// thread has unregistered, then stop the scavenger if one is running.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut guard = inner.reg_lock.lock().expect("registration mutex poisoned");
            inner.shutting_down.store(true, Ordering::SeqCst);
            while inner.active_threads.load(Ordering::Acquire) > 0 {
                guard = inner
                    .shutdown_cv
                    .wait(guard)
                    .expect("registration mutex poisoned");
            }
        }
        // Join outside the lock: the scavenger's trim pass takes it.
        let scav = inner
            .scavenger
            .lock()
            .expect("scavenger mutex poisoned")
            .take();
        if let Some(scav) = scav {
            scav.stop.store(true, Ordering::Release);
            scav.unparker.unpark();
            let _ = scav.handle.join();
        }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Start the background scavenger: every `interval` it deallocates
    /// overflow records (those outside every preallocated block) from the
    /// global free list, shrinking back toward the preallocated footprint.
    ///
    /// Per-thread caches are never touched; only their owner (or the guard
    /// drop at thread exit) may drain them.
    ///
    /// # Panics
    ///
    /// Panics if a scavenger is already running.
    pub fn start_scavenger(&self, interval: Duration) {
        let mut slot = self
            .inner
            .scavenger
            .lock()
            .expect("scavenger mutex poisoned");
        assert!(slot.is_none(), "scavenger already running");

        let stop = Arc::new(AtomicBool::new(false));
        let parker = crossbeam_utils::sync::Parker::new();
        let unparker = parker.unparker().clone();
        let weak = Arc::downgrade(&self.inner);
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("pool-scavenger".into())
            .spawn(move || loop {
                parker.park_timeout(interval);
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                // Weak: the scavenger must not keep a dead pool alive.
                let Some(inner) = weak.upgrade() else { break };
                inner.trim_overflow();
            })
            .expect("failed to spawn pool scavenger thread");

        *slot = Some(Scavenger {
            stop,
            unparker,
            handle,
        });
    }
}

// ============================================================================
// PoolThreadGuard
// ============================================================================

/// Scoped registration of the current thread with a pool.
///
/// Not `Send`: the guard must drop on the thread it registered, because drop
/// drains that thread's cache.
pub struct PoolThreadGuard<T> {
    pool: ObjectPool<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Drop for PoolThreadGuard<T> {
    fn drop(&mut self) {
        let inner = &self.pool.inner;
        let _guard = inner
            .reg_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Drain this thread's cache into the global free list. Order is not
        // preserved and need not be.
        let mut head = THREAD_CACHES.with(|caches| {
            let slot = caches
                .borrow_mut()
                .remove(&inner.pool_id)
                .expect("unregister without register");
            slot.head as *mut Node<T>
        });
        while let Some(node) = NonNull::new(head) {
            head = unsafe { node.as_ref().next.load(Ordering::Relaxed) };
            inner.push_global(node);
        }

        let prev = inner.active_threads.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unregister without register");
        if prev == 1 && inner.shutting_down.load(Ordering::Relaxed) {
            inner.shutdown_cv.notify_all();
        }
    }
}

// ============================================================================
// Pooled
// ============================================================================

/// Owning handle to a constructed record.
///
/// Dereferences to `T`. Dropping runs the reset hook, destroys the `T`, and
/// returns the record to the dropping thread's cache (overflowing to the
/// global free list). The handle may be sent to and dropped on any thread.
pub struct Pooled<T> {
    node: NonNull<Node<T>>,
    pool: ObjectPool<T>,
}

// SAFETY: the record is exclusively owned by this handle; `T: Send` makes the
// handoff sound.
unsafe impl<T: Send> Send for Pooled<T> {}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the slot was written at acquire and stays valid until drop.
        unsafe { &*Inner::slot_ptr(self.node) }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus `&mut self` gives exclusivity.
        unsafe { &mut *Inner::slot_ptr(self.node) }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: this handle exclusively owns a constructed record.
        unsafe { self.pool.inner.release_node(self.node) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
