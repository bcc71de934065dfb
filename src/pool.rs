//! Recyclable per-message task slots, pooled per size class.
//!
//! Grounded directly on the original implementation's RDMA memory pool
//! (`xio_rdma_mempool.c`): a free list per size class, linked through the
//! block itself, guarded by a single packed word combining a "claimed by
//! free-list" bit with an external-holder refcount (the Michael/Valois
//! scheme referenced in the design notes). `acquire` pops from the head
//! with an ABA-safe "safe read" (hold the head via +2 before
//! dereferencing, release if it moved); `release` decrements the holder
//! count and only pushes back onto the free list when it provably reaches
//! zero in the same compare-exchange as setting the claim bit.
//!
//! Growth mirrors the source too: a class is expanded under a per-class
//! spinlock in bounded increments, and existing blocks are never moved, so
//! pointers (here, indices) handed out earlier stay valid forever.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::message::Message;

/// Size classes a task's backing buffer is drawn from. `Unbounded` is the
/// fallback when a request exceeds the largest fixed class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Kb16,
    Kb64,
    Kb256,
    Mb1,
    Unbounded,
}

impl SizeClass {
    const ALL: [SizeClass; 5] = [
        SizeClass::Kb16,
        SizeClass::Kb64,
        SizeClass::Kb256,
        SizeClass::Mb1,
        SizeClass::Unbounded,
    ];

    pub fn max_len(&self) -> usize {
        match self {
            SizeClass::Kb16 => 16 * 1024,
            SizeClass::Kb64 => 64 * 1024,
            SizeClass::Kb256 => 256 * 1024,
            SizeClass::Mb1 => 1024 * 1024,
            SizeClass::Unbounded => usize::MAX,
        }
    }

    fn for_size(size: usize) -> SizeClass {
        Self::ALL
            .into_iter()
            .find(|c| size <= c.max_len())
            .unwrap_or(SizeClass::Unbounded)
    }

    fn next(&self) -> Option<SizeClass> {
        let idx = Self::ALL.iter().position(|c| c == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Default slab tuning for this class; exposed for [`crate::config::CoreConfig`].
    pub fn default_limits(&self) -> ClassLimits {
        ClassLimits::defaults_for(*self)
    }
}

/// Per-class tuning: initial block count, max block count, and growth
/// increment, matching the four bounded classes in the original mempool
/// (16K/64K/256K/1M) plus an unbounded overflow class.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimits {
    pub initial: usize,
    pub max: usize,
    pub growth: usize,
}

impl ClassLimits {
    fn defaults_for(class: SizeClass) -> ClassLimits {
        match class {
            SizeClass::Kb16 => ClassLimits { initial: 128, max: 4096, growth: 128 },
            SizeClass::Kb64 => ClassLimits { initial: 64, max: 2048, growth: 64 },
            SizeClass::Kb256 => ClassLimits { initial: 16, max: 512, growth: 16 },
            SizeClass::Mb1 => ClassLimits { initial: 4, max: 128, growth: 4 },
            // The fallback class has no fixed ceiling; it still grows in
            // bounded increments so a single burst can't pin the grow lock
            // for an unbounded amount of time.
            SizeClass::Unbounded => ClassLimits { initial: 0, max: usize::MAX, growth: 8 },
        }
    }
}

/// State a [`Task`] moves through from allocation to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Queued,
    Inflight,
    Delivered,
    Completed,
}

/// One in-flight message slot.
///
/// `refcnt_claim` packs the free-list claim bit (lowest bit) with an
/// external-holder count (upper bits, counted in steps of 2) into a single
/// atomic word, exactly as the original mempool's `combind_t` does.
struct TaskSlot {
    refcnt_claim: AtomicUsize,
    next: AtomicUsize,
    class: SizeClass,
    buf: Mutex<Vec<u8>>,
    state: Mutex<TaskState>,
    serial_num: AtomicUsize,
    connection_id: AtomicUsize,
    sender_task: AtomicUsize,
}

const NIL: usize = usize::MAX;
const CLAIMED: usize = 1;

impl TaskSlot {
    fn new(class: SizeClass) -> Self {
        TaskSlot {
            refcnt_claim: AtomicUsize::new(CLAIMED),
            next: AtomicUsize::new(NIL),
            class,
            buf: Mutex::new(Vec::new()),
            state: Mutex::new(TaskState::Init),
            serial_num: AtomicUsize::new(0),
            connection_id: AtomicUsize::new(NIL),
            sender_task: AtomicUsize::new(NIL),
        }
    }
}

struct SlotClass {
    slots: Mutex<Vec<TaskSlot>>,
    free_head: AtomicUsize,
    limits: ClassLimits,
    grow_lock: Mutex<()>,
}

impl SlotClass {
    fn new(class: SizeClass, limits: ClassLimits) -> Self {
        let mut slots = Vec::with_capacity(limits.initial);
        for i in 0..limits.initial {
            slots.push(TaskSlot::new(class));
            if i > 0 {
                slots[i - 1].next.store(i, Ordering::Relaxed);
            }
        }
        let free_head = if limits.initial > 0 {
            slots[limits.initial - 1].next.store(NIL, Ordering::Relaxed);
            0
        } else {
            NIL
        };
        SlotClass {
            slots: Mutex::new(slots),
            free_head: AtomicUsize::new(free_head),
            limits,
            grow_lock: Mutex::new(()),
        }
    }

    /// "safe_read": hold the head (+2) before dereferencing, release if it moved.
    fn safe_read(&self) -> Option<usize> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head == NIL {
                return None;
            }
            {
                let slots = self.slots.lock();
                slots[head].refcnt_claim.fetch_add(2, Ordering::AcqRel);
            }
            if self.free_head.load(Ordering::Acquire) == head {
                return Some(head);
            }
            self.release(head);
        }
    }

    /// "decrement_and_test_and_set": drop a hold; if it hits zero, claim it atomically.
    fn release(&self, idx: usize) {
        let slots = self.slots.lock();
        let word = &slots[idx].refcnt_claim;
        loop {
            let old = word.load(Ordering::Acquire);
            let mut new = old.wrapping_sub(2);
            let claimed = new == 0;
            if claimed {
                new = CLAIMED;
            }
            if word
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if claimed {
                    drop(slots);
                    self.reclaim(idx);
                }
                return;
            }
        }
    }

    fn reclaim(&self, idx: usize) {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            {
                let slots = self.slots.lock();
                slots[idx].next.store(head, Ordering::Release);
            }
            if self
                .free_head
                .compare_exchange_weak(head, idx, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop one slot off the free list, retrying through the safe-read dance
    /// until either a slot is won or the list is observed empty.
    fn try_acquire(&self) -> Option<usize> {
        loop {
            let idx = self.safe_read()?;
            let next = {
                let slots = self.slots.lock();
                slots[idx].next.load(Ordering::Acquire)
            };
            if self
                .free_head
                .compare_exchange_weak(idx, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let slots = self.slots.lock();
                slots[idx].refcnt_claim.fetch_sub(CLAIMED, Ordering::AcqRel);
                return Some(idx);
            }
            self.release(idx);
        }
    }

    /// Serialized growth: append a contiguous batch of new slots, linking
    /// them onto the free list. Existing indices remain valid.
    fn grow(&self) -> bool {
        let _g = self.grow_lock.lock();
        let mut slots = self.slots.lock();
        let remaining = self.limits.max.saturating_sub(slots.len());
        if remaining == 0 {
            return false;
        }
        let n = remaining.min(self.limits.growth.max(1));
        let base = slots.len();
        for i in 0..n {
            slots.push(TaskSlot::new(self.class));
            if i > 0 {
                slots[base + i - 1].next.store(base + i, Ordering::Relaxed);
            }
        }
        drop(slots);

        loop {
            let head = self.free_head.load(Ordering::Acquire);
            {
                let slots = self.slots.lock();
                slots[base + n - 1].next.store(head, Ordering::Release);
            }
            if self
                .free_head
                .compare_exchange_weak(head, base, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// A handle to one acquired task slot. Holds a +2 reference on the slot
/// for as long as this handle (or a clone made via [`TaskPool::addref`])
/// lives; dropping all holders and calling [`TaskPool::release`] returns
/// the slot to its class's free list.
#[derive(Clone)]
pub struct Task {
    pool: Arc<TaskPoolInner>,
    class: SizeClass,
    idx: usize,
}

impl Task {
    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn state(&self) -> TaskState {
        let c = &self.pool.classes[class_index(self.class)];
        *c.slots.lock()[self.idx].state.lock()
    }

    pub fn set_state(&self, state: TaskState) {
        let c = &self.pool.classes[class_index(self.class)];
        *c.slots.lock()[self.idx].state.lock() = state;
    }

    pub fn set_buf(&self, data: Vec<u8>) {
        let c = &self.pool.classes[class_index(self.class)];
        *c.slots.lock()[self.idx].buf.lock() = data;
    }

    pub fn buf(&self) -> Vec<u8> {
        let c = &self.pool.classes[class_index(self.class)];
        c.slots.lock()[self.idx].buf.lock().clone()
    }

    pub fn serial_num(&self) -> u64 {
        let c = &self.pool.classes[class_index(self.class)];
        c.slots.lock()[self.idx].serial_num.load(Ordering::Acquire) as u64
    }

    pub fn set_serial_num(&self, sn: u64) {
        let c = &self.pool.classes[class_index(self.class)];
        c.slots.lock()[self.idx]
            .serial_num
            .store(sn as usize, Ordering::Release);
    }

    /// Identity used to key the in-flight task list (unique per live task
    /// within a pool, stable until release).
    pub fn id(&self) -> usize {
        class_index(self.class) * 1_000_000_000 + self.idx
    }

    /// Back-pointer to the owning connection, keyed by the connection's
    /// arena index (see [`crate::connection::ConnectionId`]).
    pub fn connection_id(&self) -> Option<usize> {
        let c = &self.pool.classes[class_index(self.class)];
        match c.slots.lock()[self.idx].connection_id.load(Ordering::Acquire) {
            NIL => None,
            v => Some(v),
        }
    }

    pub fn set_connection_id(&self, id: usize) {
        let c = &self.pool.classes[class_index(self.class)];
        c.slots.lock()[self.idx]
            .connection_id
            .store(id, Ordering::Release);
    }

    /// Back-pointer to the request task this task is a response for, if any.
    pub fn sender_task_id(&self) -> Option<usize> {
        let c = &self.pool.classes[class_index(self.class)];
        match c.slots.lock()[self.idx].sender_task.load(Ordering::Acquire) {
            NIL => None,
            v => Some(v),
        }
    }

    pub fn set_sender_task_id(&self, id: usize) {
        let c = &self.pool.classes[class_index(self.class)];
        c.slots.lock()[self.idx]
            .sender_task
            .store(id, Ordering::Release);
    }
}

fn class_index(class: SizeClass) -> usize {
    SizeClass::ALL.iter().position(|c| *c == class).unwrap()
}

struct TaskPoolInner {
    classes: [SlotClass; 5],
}

/// Lock-free multi-producer slab of [`Task`] slots, carved into size classes.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<TaskPoolInner>,
}

impl TaskPool {
    /// Build a pool with per-class slab tuning taken from `config`, matching
    /// the original mempool's static per-size-class block counts.
    pub fn new(config: &CoreConfig) -> Self {
        TaskPool {
            inner: Arc::new(TaskPoolInner {
                classes: [
                    SlotClass::new(SizeClass::Kb16, config.slab_kb16.into()),
                    SlotClass::new(SizeClass::Kb64, config.slab_kb64.into()),
                    SlotClass::new(SizeClass::Kb256, config.slab_kb256.into()),
                    SlotClass::new(SizeClass::Mb1, config.slab_mb1.into()),
                    SlotClass::new(SizeClass::Unbounded, config.slab_unbounded.into()),
                ],
            }),
        }
    }

    /// Acquire a task slot sized to hold at least `len` bytes. Promotes to
    /// the next size class when the requested class is exhausted and
    /// cannot be grown; exhausting the unbounded class fails `NoResources`.
    pub fn acquire(&self, len: usize) -> Result<Task> {
        let mut class = SizeClass::for_size(len);
        loop {
            let slot_class = &self.inner.classes[class_index(class)];
            if let Some(idx) = slot_class.try_acquire() {
                return Ok(Task {
                    pool: self.inner.clone(),
                    class,
                    idx,
                });
            }
            if slot_class.grow() {
                continue;
            }
            match class.next() {
                Some(next) => class = next,
                None => return Err(CoreError::NoResources),
            }
        }
    }

    /// Add an external hold on a task (e.g. a response's back-pointer to
    /// its request). Matches the `addref` contract in the design.
    pub fn addref(&self, task: &Task) {
        let c = &self.inner.classes[class_index(task.class)];
        c.slots.lock()[task.idx]
            .refcnt_claim
            .fetch_add(2, Ordering::AcqRel);
    }

    /// Drop one hold; the slot returns to its class's free list only once
    /// the last hold is released (refcount and claim bit share one word,
    /// so this can never race a concurrent `acquire`).
    pub fn release(&self, task: &Task) {
        let c = &self.inner.classes[class_index(task.class)];
        task.set_state(TaskState::Completed);
        c.release(task.idx);
    }

    /// Total free slots across every class; used by leak-freedom tests.
    pub fn free_count(&self) -> usize {
        self.inner
            .classes
            .iter()
            .map(|c| {
                let mut n = 0;
                let mut cur = c.free_head.load(Ordering::Acquire);
                let slots = c.slots.lock();
                while cur != NIL {
                    n += 1;
                    cur = slots[cur].next.load(Ordering::Acquire);
                }
                n
            })
            .sum()
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(&CoreConfig::default())
    }
}

/// Acquire a task pre-loaded with a framed [`Message`] payload; convenience
/// wrapper used by [`crate::connection::Connection`].
pub fn acquire_for_message(pool: &TaskPool, msg: &Message) -> Result<Task> {
    let len = msg.header.len() + msg.data.len();
    let task = pool.acquire(len)?;
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&msg.header);
    buf.extend_from_slice(&msg.data);
    task.set_buf(buf);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trip_is_leak_free() {
        let pool = TaskPool::new(&CoreConfig::default());
        let initial_free = pool.free_count();

        for _ in 0..1000 {
            let task = pool.acquire(100).unwrap();
            task.set_state(TaskState::Inflight);
            pool.release(&task);
        }

        assert_eq!(pool.free_count(), initial_free);
    }

    #[test]
    fn refcounted_tasks_survive_until_last_release() {
        let pool = TaskPool::new(&CoreConfig::default());
        let initial_free = pool.free_count();
        let task = pool.acquire(10).unwrap();
        pool.addref(&task);

        // one hold remains after this release (addref added a second one),
        // so the slot must not yet be back on the free list.
        pool.release(&task);
        assert_eq!(pool.free_count(), initial_free - 1);

        pool.release(&task);
        assert_eq!(pool.free_count(), initial_free);
    }

    #[test]
    fn promotes_to_next_size_class() {
        let pool = TaskPool::new(&CoreConfig::default());
        let task = pool.acquire(20 * 1024).unwrap();
        assert_eq!(task.class(), SizeClass::Kb64);
    }

    #[test]
    fn size_class_selection() {
        assert_eq!(SizeClass::for_size(10), SizeClass::Kb16);
        assert_eq!(SizeClass::for_size(16 * 1024), SizeClass::Kb16);
        assert_eq!(SizeClass::for_size(16 * 1024 + 1), SizeClass::Kb64);
        assert_eq!(SizeClass::for_size(usize::MAX), SizeClass::Unbounded);
    }
}
