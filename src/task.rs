//! Tasks and address-space shims
//!
//! Multitask configurations give every task an address space and code and
//! data segments; one task is current per core and dispatch activates the
//! next thread's when it differs. The MMU side is consumed through a
//! narrow attach/detach/activate interface, modeled here as virtual-range
//! bookkeeping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use crate::config;
use crate::types::{CpuId, TaskId, ThreadId};

const PAGE: usize = 4096;

// ============================================================================
// Segment
// ============================================================================

/// A memory segment: stacks, code, data.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    size: usize,
}

static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(1);

impl Segment {
    pub fn new(size: usize) -> Self {
        Self {
            id: NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// Page-granular virtual-range bookkeeping behind the MMU interface.
#[derive(Debug)]
pub struct AddressSpace {
    attached: Mutex<Vec<(u64, usize)>>,
    next_base: AtomicUsize,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(Vec::new()),
            next_base: AtomicUsize::new(PAGE),
        }
    }

    /// Map a segment; returns its base address in this space.
    pub fn attach(&self, segment: &Segment) -> usize {
        let span = (segment.size + PAGE - 1) & !(PAGE - 1);
        let base = self.next_base.fetch_add(span, Ordering::Relaxed);
        self.attached.lock().push((segment.id, base));
        base
    }

    /// Unmap a segment previously attached at `base`.
    pub fn detach(&self, segment: &Segment, base: usize) {
        self.attached
            .lock()
            .retain(|&(id, b)| !(id == segment.id && b == base));
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Task
// ============================================================================

/// An address space, code and data segments, and the threads living in
/// them.
pub struct Task {
    id: TaskId,
    address_space: AddressSpace,
    code: Option<Segment>,
    data: Option<Segment>,
    main: Mutex<Option<ThreadId>>,
    threads: Mutex<Vec<ThreadId>>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn code_segment(&self) -> Option<&Segment> {
        self.code.as_ref()
    }

    pub fn data_segment(&self) -> Option<&Segment> {
        self.data.as_ref()
    }

    pub fn main(&self) -> Option<ThreadId> {
        *self.main.lock()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }
}

// ============================================================================
// Registry
// ============================================================================

static TASKS: Once<Mutex<BTreeMap<TaskId, Arc<Task>>>> = Once::new();
static NEXT_TASK: AtomicU64 = AtomicU64::new(TaskId::KERNEL.0 + 1);
static CURRENT: [AtomicU64; config::CPUS] =
    [const { AtomicU64::new(TaskId::KERNEL.0) }; config::CPUS];

fn tasks() -> &'static Mutex<BTreeMap<TaskId, Arc<Task>>> {
    TASKS.call_once(|| {
        let mut map = BTreeMap::new();
        let kernel = Arc::new(Task {
            id: TaskId::KERNEL,
            address_space: AddressSpace::new(),
            code: None,
            data: None,
            main: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });
        map.insert(TaskId::KERNEL, kernel);
        Mutex::new(map)
    })
}

/// Create a task around code and data segments; its address space maps
/// both.
pub fn create(code: Segment, data: Segment) -> Arc<Task> {
    let address_space = AddressSpace::new();
    address_space.attach(&code);
    address_space.attach(&data);

    let id = TaskId(NEXT_TASK.fetch_add(1, Ordering::Relaxed));
    let task = Arc::new(Task {
        id,
        address_space,
        code: Some(code),
        data: Some(data),
        main: Mutex::new(None),
        threads: Mutex::new(Vec::new()),
    });
    tasks().lock().insert(id, Arc::clone(&task));
    task
}

pub fn find(id: TaskId) -> Option<Arc<Task>> {
    tasks().lock().get(&id).cloned()
}

/// The task current on `cpu`.
pub fn current(cpu: CpuId) -> Option<Arc<Task>> {
    find(current_id(cpu))
}

pub fn current_id(cpu: CpuId) -> TaskId {
    let _ = tasks();
    TaskId(CURRENT[cpu as usize].load(Ordering::Relaxed))
}

/// Make `id` current on the calling core (address-space activation).
pub fn activate(id: TaskId) {
    CURRENT[crate::cpu::id() as usize].store(id.0, Ordering::Relaxed);
}

pub(crate) fn attach_thread(task: TaskId, thread: ThreadId) {
    if let Some(t) = find(task) {
        let mut threads = t.threads.lock();
        if threads.is_empty() {
            *t.main.lock() = Some(thread);
        }
        threads.push(thread);
    }
}

pub(crate) fn detach_thread(task: TaskId, thread: ThreadId) {
    if let Some(t) = find(task) {
        t.threads.lock().retain(|&id| id != thread);
        let mut main = t.main.lock();
        if *main == Some(thread) {
            *main = None;
        }
    }
}

pub(crate) fn attach_segment(task: TaskId, segment: &Segment) -> usize {
    match find(task) {
        Some(t) => t.address_space.attach(segment),
        None => 0,
    }
}

pub(crate) fn detach_segment(task: TaskId, segment: &Segment, base: usize) {
    if let Some(t) = find(task) {
        t.address_space.detach(segment, base);
    }
}

#[cfg(test)]
pub(crate) fn reset() {
    let mut map = tasks().lock();
    map.retain(|&id, _| id == TaskId::KERNEL);
    if let Some(kernel) = map.get(&TaskId::KERNEL) {
        kernel.threads.lock().clear();
        *kernel.main.lock() = None;
    }
    for slot in CURRENT.iter() {
        slot.store(TaskId::KERNEL.0, Ordering::Relaxed);
    }
}
