use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heap::SenseBarrier;
use parking_lot::{Condvar, Mutex};

use crate::interpreter::{interpret, InterruptKind};
use crate::port::PortHandle;
use crate::process::{Process, ProcessState};
use crate::program::Program;

/// A queue entry; processes are owned by the program's process list and
/// referenced raw while scheduled.
#[derive(Clone, Copy, PartialEq, Eq)]
struct ProcessPtr(NonNull<Process>);

// SAFETY: ownership is handed between workers through atomic state flips.
unsafe impl Send for ProcessPtr {}

struct Worker {
    queue: Mutex<VecDeque<ProcessPtr>>,
    has_work: Condvar,
}

impl Worker {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), has_work: Condvar::new() }
    }

    fn push(&self, process: ProcessPtr) {
        self.queue.lock().push_back(process);
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<ProcessPtr> {
        self.queue.lock().pop_front()
    }

    fn steal_back(&self) -> Option<ProcessPtr> {
        self.queue.lock().pop_back()
    }
}

struct SchedulerInner {
    program: Arc<Program>,
    workers: Vec<Worker>,
    current: Vec<Mutex<Option<ProcessPtr>>>,
    startup_queue: Mutex<VecDeque<ProcessPtr>>,
    processes: AtomicUsize,
    next_placement: AtomicUsize,

    // Stop-the-world machinery for the immutable-heap collection.
    gc_pause: AtomicBool,
    gc_leader_claimed: AtomicBool,
    barrier: SenseBarrier,

    // Session pause: workers park here while the program is stopped.
    session_paused: AtomicBool,
    paused_workers: Mutex<usize>,
    paused_cond: Condvar,

    shutdown: AtomicBool,
    result: AtomicI32,

    breakpoint_sink:
        Mutex<Option<Box<dyn Fn(NonNull<Process>) + Send + 'static>>>,
}

/// The worker-pool scheduler: binds ready processes to a small fixed set
/// of worker threads, preempts them on a monotonic tick, routes target
/// yields, and coordinates the stop-the-world immutable collection.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(program: Arc<Program>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let inner = SchedulerInner {
            program,
            workers: (0..worker_count).map(|_| Worker::new()).collect(),
            current: (0..worker_count).map(|_| Mutex::new(None)).collect(),
            startup_queue: Mutex::new(VecDeque::new()),
            processes: AtomicUsize::new(0),
            next_placement: AtomicUsize::new(0),
            gc_pause: AtomicBool::new(false),
            gc_leader_claimed: AtomicBool::new(false),
            barrier: SenseBarrier::new(),
            session_paused: AtomicBool::new(false),
            paused_workers: Mutex::new(0),
            paused_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            result: AtomicI32::new(0),
            breakpoint_sink: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Run the program's root process to completion, driving workers and
    /// the preemption tick. Returns the exit status: 0 for a clean
    /// termination, 255 when an uncaught exception tore a process down.
    pub fn run(&self, main_process: NonNull<Process>) -> i32 {
        let inner = &self.inner;
        inner.program.set_scheduler(Some(self.clone()));
        inner.processes.store(1, Ordering::SeqCst);
        // SAFETY: freshly spawned process.
        let ok = unsafe { main_process.as_ref() }
            .change_state(ProcessState::Sleeping, ProcessState::Ready);
        debug_assert!(ok);
        self.enqueue(ProcessPtr(main_process));

        let handles: Vec<_> = (0..inner.workers.len())
            .map(|id| {
                let scheduler = self.clone();
                std::thread::Builder::new()
                    .name(format!("funke-worker-{id}"))
                    .spawn(move || scheduler.worker_loop(id))
                    .expect("spawn worker")
            })
            .collect();

        // The preemption tick: wait between 1 and 100 ms depending on
        // the pool size, nudging one worker per round.
        let tick =
            Duration::from_millis((100 / inner.workers.len().max(1)).max(1) as u64);
        let mut round = 0;
        while inner.processes.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(tick);
            self.preempt_worker_process(round % inner.workers.len());
            round += 1;
        }

        inner.shutdown.store(true, Ordering::SeqCst);
        for worker in &inner.workers {
            worker.has_work.notify_all();
        }
        self.inner.paused_cond.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        inner.program.set_scheduler(None);
        inner.result.load(Ordering::SeqCst)
    }

    // ── Enqueueing and wakeups ─────────────────────────────────────

    fn enqueue(&self, process: ProcessPtr) {
        // SAFETY: enqueued processes are alive.
        debug_assert_eq!(
            unsafe { process.0.as_ref() }.state(),
            ProcessState::Ready
        );
        let index = self.inner.next_placement.fetch_add(1, Ordering::Relaxed)
            % self.inner.workers.len();
        self.inner.workers[index].push(process);
    }

    /// Wake a process that went to sleep on an empty mailbox.
    pub fn resume_process(&self, process: NonNull<Process>) {
        // SAFETY: ports only resolve live owners.
        if unsafe { process.as_ref() }
            .change_state(ProcessState::Sleeping, ProcessState::Ready)
        {
            self.enqueue(ProcessPtr(process));
        }
    }

    /// Place a freshly spawned process (round-robin).
    pub fn enqueue_spawned(&self, process: NonNull<Process>) {
        self.inner.processes.fetch_add(1, Ordering::SeqCst);
        // SAFETY: spawn hands over a sleeping process.
        let ok = unsafe { process.as_ref() }
            .change_state(ProcessState::Sleeping, ProcessState::Ready);
        debug_assert!(ok);
        self.enqueue(ProcessPtr(process));
    }

    /// Resume a process parked at a breakpoint.
    pub fn process_continue(&self, process: NonNull<Process>) {
        // SAFETY: the session owns parked processes.
        let resumed = unsafe { process.as_ref() }
            .change_state(ProcessState::Breakpoint, ProcessState::Ready)
            || unsafe { process.as_ref() }
                .change_state(ProcessState::UncaughtException, ProcessState::Ready);
        if resumed {
            self.enqueue(ProcessPtr(process));
        }
    }

    pub fn set_breakpoint_sink(
        &self,
        sink: Option<Box<dyn Fn(NonNull<Process>) + Send + 'static>>,
    ) {
        *self.inner.breakpoint_sink.lock() = sink;
    }

    // ── Preemption ─────────────────────────────────────────────────

    fn preempt_worker_process(&self, worker_id: usize) {
        let current = self.inner.current[worker_id].lock();
        if let Some(process) = *current {
            // SAFETY: the slot only holds live running processes.
            unsafe { process.0.as_ref() }.preempt();
        }
    }

    fn preempt_all(&self) {
        for id in 0..self.inner.workers.len() {
            self.preempt_worker_process(id);
        }
        for worker in &self.inner.workers {
            worker.has_work.notify_all();
        }
    }

    // ── Session pause ──────────────────────────────────────────────

    /// Stop every process at its next quiescent point; returns once all
    /// workers are parked. Program mutation is safe until
    /// [`Scheduler::resume_program`].
    pub fn stop_program(&self) {
        self.inner.session_paused.store(true, Ordering::SeqCst);
        self.preempt_all();
        let mut paused = self.inner.paused_workers.lock();
        while *paused < self.inner.workers.len()
            && !self.inner.shutdown.load(Ordering::SeqCst)
        {
            self.inner.paused_cond.wait_for(&mut paused, Duration::from_millis(10));
        }
    }

    pub fn resume_program(&self) {
        self.inner.session_paused.store(false, Ordering::SeqCst);
        self.inner.paused_cond.notify_all();
        for worker in &self.inner.workers {
            worker.has_work.notify_all();
        }
    }

    // ── The worker loop ────────────────────────────────────────────

    fn worker_loop(&self, id: usize) {
        let inner = &self.inner;
        loop {
            if inner.shutdown.load(Ordering::SeqCst)
                || inner.processes.load(Ordering::SeqCst) == 0
            {
                break;
            }

            if inner.gc_pause.load(Ordering::SeqCst) {
                self.gc_rendezvous(false);
                continue;
            }

            if inner.session_paused.load(Ordering::SeqCst) {
                self.park_for_session();
                continue;
            }

            let Some(process) = self.dequeue(id) else {
                let worker = &inner.workers[id];
                let mut queue = worker.queue.lock();
                if queue.is_empty() {
                    worker
                        .has_work
                        .wait_for(&mut queue, Duration::from_millis(5));
                }
                continue;
            };
            self.run_process(id, process);
        }
    }

    fn park_for_session(&self) {
        let inner = &self.inner;
        let mut paused = inner.paused_workers.lock();
        *paused += 1;
        inner.paused_cond.notify_all();
        while inner.session_paused.load(Ordering::SeqCst)
            && !inner.shutdown.load(Ordering::SeqCst)
        {
            inner.paused_cond.wait_for(&mut paused, Duration::from_millis(10));
        }
        *paused -= 1;
    }

    fn dequeue(&self, id: usize) -> Option<ProcessPtr> {
        let inner = &self.inner;
        if let Some(process) = inner.workers[id].pop() {
            return Some(process);
        }
        for other in 0..inner.workers.len() {
            if other == id {
                continue;
            }
            if let Some(process) = inner.workers[other].steal_back() {
                return Some(process);
            }
        }
        inner.startup_queue.lock().pop_front()
    }

    fn run_process(&self, id: usize, process: ProcessPtr) {
        let inner = &self.inner;
        // SAFETY: dequeued processes are alive and Ready.
        if !unsafe { process.0.as_ref() }
            .change_state(ProcessState::Ready, ProcessState::Running)
        {
            return;
        }

        let mut process = process;
        loop {
            *inner.current[id].lock() = Some(process);
            // SAFETY: the state flip gave this worker exclusive ownership.
            let interpretation = unsafe { interpret(&mut *process.0.as_ptr()) };
            *inner.current[id].lock() = None;

            // SAFETY: still exclusively owned.
            let process_ref = unsafe { &mut *process.0.as_ptr() };

            match interpretation.kind {
                InterruptKind::Interrupt => {
                    process_ref
                        .change_state(ProcessState::Running, ProcessState::Ready);
                    if inner.gc_pause.load(Ordering::SeqCst)
                        || inner.session_paused.load(Ordering::SeqCst)
                    {
                        // Keep the process queued; the pause machinery
                        // takes over at the loop top.
                        self.enqueue(process);
                    } else {
                        inner.workers[id].push(process);
                    }
                    return;
                }
                InterruptKind::Yielded => {
                    process_ref
                        .change_state(ProcessState::Running, ProcessState::Yielding);
                    if process_ref.mailbox_is_empty() {
                        process_ref.change_state(
                            ProcessState::Yielding,
                            ProcessState::Sleeping,
                        );
                        // A message may have raced the transition.
                        if !process_ref.mailbox_is_empty()
                            && process_ref.change_state(
                                ProcessState::Sleeping,
                                ProcessState::Ready,
                            )
                        {
                            self.enqueue(process);
                        }
                    } else {
                        process_ref.change_state(
                            ProcessState::Yielding,
                            ProcessState::Ready,
                        );
                        inner.workers[id].push(process);
                    }
                    return;
                }
                InterruptKind::TargetYielded => {
                    let target = interpretation
                        .target_yield
                        .and_then(|value| {
                            // SAFETY: the native returned a live port value.
                            unsafe {
                                PortHandle::from_value(&inner.program, value)
                            }
                        })
                        .and_then(|port| port.owner());

                    process_ref
                        .change_state(ProcessState::Running, ProcessState::Ready);
                    self.enqueue(process);

                    if let Some(target) = target {
                        // SAFETY: port owners are live.
                        if unsafe { target.as_ref() }.change_state(
                            ProcessState::Sleeping,
                            ProcessState::Running,
                        ) {
                            // Direct handoff: run the receiver next.
                            process = ProcessPtr(target);
                            continue;
                        }
                    }
                    return;
                }
                InterruptKind::ImmutableAllocationFailure => {
                    // This worker leads the collection and then retries
                    // the same process.
                    self.gc_rendezvous(true);
                    continue;
                }
                InterruptKind::Terminated => {
                    process_ref.change_state(
                        ProcessState::Running,
                        ProcessState::Terminated,
                    );
                    self.finish_process(process);
                    return;
                }
                InterruptKind::UncaughtException => {
                    process_ref.change_state(
                        ProcessState::Running,
                        ProcessState::UncaughtException,
                    );
                    inner.result.store(255, Ordering::SeqCst);
                    self.finish_process(process);
                    return;
                }
                InterruptKind::Breakpoint => {
                    process_ref.change_state(
                        ProcessState::Running,
                        ProcessState::Breakpoint,
                    );
                    let sink = inner.breakpoint_sink.lock();
                    if let Some(sink) = sink.as_ref() {
                        sink(process.0);
                    } else {
                        // No session: nothing can resume it; drop it.
                        drop(sink);
                        self.finish_process(process);
                    }
                    return;
                }
                InterruptKind::Ready => {
                    unreachable!("the interpreter never returns ready")
                }
            }
        }
    }

    fn finish_process(&self, process: ProcessPtr) {
        let inner = &self.inner;
        // SAFETY: exclusively owned, removed from every queue.
        unsafe {
            let process_ref = &mut *process.0.as_ptr();
            process_ref.notify_linked_ports();
            process_ref.drop_immutable_part();
        }
        inner.program.delete_process(process.0);
        if inner.processes.fetch_sub(1, Ordering::SeqCst) == 1 {
            for worker in &inner.workers {
                worker.has_work.notify_all();
            }
        }
    }

    // ── Immutable-heap collection rendezvous ───────────────────────

    /// Park until every worker arrives, run the collection on the
    /// requesting worker, release everyone.
    fn gc_rendezvous(&self, requester: bool) {
        let inner = &self.inner;
        let leader = requester
            && !inner.gc_leader_claimed.swap(true, Ordering::SeqCst);
        if requester {
            inner.gc_pause.store(true, Ordering::SeqCst);
            self.preempt_all();
        }

        inner.barrier.wait(inner.workers.len());

        if leader {
            // Surrender every outstanding allocation part, then scavenge
            // with roots from every process.
            inner.program.each_process(&mut |process| {
                process.drop_immutable_part();
            });
            // SAFETY: all workers are parked at the barrier.
            unsafe { inner.program.collect_immutable_garbage() };
            inner.gc_pause.store(false, Ordering::SeqCst);
            inner.gc_leader_claimed.store(false, Ordering::SeqCst);
        }

        inner.barrier.wait(inner.workers.len());
    }
}
