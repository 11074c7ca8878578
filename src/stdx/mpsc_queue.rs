//! Lock-free many-producer, single-consumer FIFO.
//!
//! Intrusive linked queue with a dummy node (Vyukov style). Producers are
//! wait-free: one atomic exchange on the head plus one release store links a
//! node. The consumer walks `tail.next` and frees the node it leaves behind.
//!
//! # Ordering
//!
//! FIFO with respect to the linearization point of the head exchange.
//!
//! # Transient empty
//!
//! Between a producer's head exchange and its `next` store, the consumer can
//! observe an empty queue even though a push is in flight. Callers must treat
//! [`MpscConsumer::pop`] returning `None` as "try again later", never as "no
//! producer will ever push".
//!
//! # Safety
//!
//! The tail pointer is touched only by the single consumer; the type system
//! enforces this ([`MpscConsumer`] is not `Clone` and `pop` takes `&mut`).
//! A popped-over node is freed only after the consumer has observed its
//! `next` store, so producers never write into freed memory.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// `None` only for the dummy node.
    item: Option<T>,
}

struct Inner<T> {
    /// Most recently pushed node. Producers swap this.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// Dummy/last-consumed node. Consumer-only.
    tail: CachePadded<UnsafeCell<*mut Node<T>>>,
    len: AtomicUsize,
}

// SAFETY: producers only touch `head` (atomic); `tail` is confined to the
// unique consumer; nodes are handed off by the release/acquire pair on
// `next`.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Last reference: no producer or consumer remains, the whole chain
        // from the dummy onward belongs to us.
        let mut node = *self.tail.get_mut();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

/// Create a queue and split it into its producer and consumer halves.
pub fn channel<T>() -> (MpscProducer<T>, MpscConsumer<T>) {
    let dummy = Box::into_raw(Box::new(Node {
        next: AtomicPtr::new(ptr::null_mut()),
        item: None,
    }));
    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicPtr::new(dummy)),
        tail: CachePadded::new(UnsafeCell::new(dummy)),
        len: AtomicUsize::new(0),
    });
    (
        MpscProducer {
            inner: Arc::clone(&inner),
        },
        MpscConsumer { inner },
    )
}

/// Producer half. Clone freely; `push` may be called from any thread.
pub struct MpscProducer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MpscProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MpscProducer<T> {
    /// Enqueue an item. Wait-free apart from the node allocation.
    pub fn push(&self, item: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            item: Some(item),
        }));
        // Linearization point: producers serialize on this exchange.
        let prev = self.inner.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` stays allocated until the consumer observes this
        // store; the consumer frees a node only after reading its `next`.
        unsafe { (*prev).next.store(node, Ordering::Release) };
        self.inner.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue length snapshot. Relaxed; may be stale immediately.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer half. Unique: not `Clone`, and `pop` requires `&mut self`.
pub struct MpscConsumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> MpscConsumer<T> {
    /// Dequeue the oldest item, or `None` if the queue looks empty.
    ///
    /// A `None` may race an in-flight push; see the module docs.
    pub fn pop(&mut self) -> Option<T> {
        unsafe {
            let tail = *self.inner.tail.get();
            let next = NonNull::new((*tail).next.load(Ordering::Acquire))?;
            let item = (*next.as_ptr())
                .item
                .take()
                .expect("queue node missing its item");
            // `next` becomes the new dummy; the old one is ours to free.
            *self.inner.tail.get() = next.as_ptr();
            drop(Box::from_raw(tail));
            self.inner.len.fetch_sub(1, Ordering::Relaxed);
            Some(item)
        }
    }

    /// Queue length snapshot. Relaxed; may be stale immediately.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
