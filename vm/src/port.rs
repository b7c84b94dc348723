use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use object::{Instance, Value};
use parking_lot::Mutex;

use crate::process::{Message, Process};
use crate::program::Program;

/// A reference-counted, receiver-bound message endpoint.
///
/// `send` is synchronized only against owner teardown; the mailbox push
/// takes the mailbox lock and a wakeup is issued when the queue was
/// empty. The owner pointer is cleared when the process dies, after
/// which sends are dropped on the floor.
pub struct Port {
    owner: Mutex<Option<NonNull<Process>>>,
    refs: AtomicUsize,
}

// SAFETY: all state is behind the mutex or atomic.
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

/// An owning handle: one strong reference to a [`Port`].
pub struct PortHandle(NonNull<Port>);

// SAFETY: Port is Sync; the handle only manipulates the refcount.
unsafe impl Send for PortHandle {}
unsafe impl Sync for PortHandle {}

impl PortHandle {
    /// Create a port owned by `process`, with one reference.
    pub fn new(process: NonNull<Process>) -> Self {
        let port = Box::new(Port {
            owner: Mutex::new(Some(process)),
            refs: AtomicUsize::new(1),
        });
        Self(NonNull::from(Box::leak(port)))
    }

    fn port(&self) -> &Port {
        // SAFETY: the handle holds a reference; the port is alive.
        unsafe { self.0.as_ref() }
    }

    /// Enqueue a data message, waking the owner if it was blocked on an
    /// empty queue. Returns false when the owner is gone.
    pub fn send(&self, value: Value) -> bool {
        self.deliver(Message::Data(value))
    }

    /// Enqueue a termination message.
    pub fn send_exit(&self, reason: Value) -> bool {
        self.deliver(Message::Exit(reason))
    }

    fn deliver(&self, message: Message) -> bool {
        let owner = self.port().owner.lock();
        let Some(process) = *owner else {
            return false;
        };
        // SAFETY: the owner pointer stays valid while the lock is held;
        // teardown detaches under the same lock before the process dies.
        let process_ref = unsafe { process.as_ref() };
        let was_empty = {
            let mut mailbox = process_ref.mailbox.lock();
            let was_empty = mailbox.is_empty();
            mailbox.push_back(message);
            was_empty
        };
        if was_empty {
            if let Some(scheduler) = process_ref.program.scheduler() {
                scheduler.resume_process(process);
            }
        }
        true
    }

    /// The owning process, if still alive.
    pub fn owner(&self) -> Option<NonNull<Process>> {
        *self.port().owner.lock()
    }

    /// Cut the port loose from its dying owner.
    pub fn detach(&self) {
        *self.port().owner.lock() = None;
    }

    pub fn ref_count(&self) -> usize {
        self.port().refs.load(Ordering::Acquire)
    }

    // ── Reification ────────────────────────────────────────────────

    /// Pack the port pointer into a smi (ports are 8-aligned, so three
    /// low zero bits are shifted away).
    fn handle_bits(&self) -> i64 {
        (self.0.as_ptr() as u64 >> 3) as i64
    }

    /// Wrap this port in an immutable heap instance carrying the handle
    /// bits, transferring this strong reference to the instance.
    pub fn reify(self, process: &mut Process) -> Value {
        let class = process.program.specials().port_class;
        let instance = process.new_instance(class, true);
        if instance.is_failure() {
            return instance;
        }
        // SAFETY: fresh instance of the port class (one field).
        unsafe {
            (*instance.as_mut_ptr::<Instance>())
                .set_field(0, Value::from_smi(self.handle_bits()))
        };
        core::mem::forget(self); // the instance now holds the reference
        instance
    }

    /// Recover a borrowed handle from a reified port instance.
    ///
    /// # Safety
    ///
    /// `value` must be a port instance created by [`PortHandle::reify`]
    /// whose reference is still held.
    pub unsafe fn from_value(program: &Program, value: Value) -> Option<BorrowedPort> {
        if !value.is_ref() {
            return None;
        }
        let instance = value.as_ref::<Instance>();
        if instance.header.class_value() != program.specials().port_class {
            return None;
        }
        let bits = instance.field(0);
        if !bits.is_smi() {
            return None;
        }
        let address = (bits.to_smi() as u64) << 3;
        NonNull::new(address as *mut Port).map(BorrowedPort)
    }
}

impl Clone for PortHandle {
    fn clone(&self) -> Self {
        self.port().refs.fetch_add(1, Ordering::AcqRel);
        Self(self.0)
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        if self.port().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: last reference gone.
            drop(unsafe { Box::from_raw(self.0.as_ptr()) });
        }
    }
}

/// A non-owning view used by natives; upgrade to keep the port alive.
pub struct BorrowedPort(NonNull<Port>);

impl BorrowedPort {
    pub fn upgrade(&self) -> PortHandle {
        // SAFETY: the reified instance still holds a reference.
        unsafe { self.0.as_ref() }.refs.fetch_add(1, Ordering::AcqRel);
        PortHandle(self.0)
    }

    pub fn send(&self, value: Value) -> bool {
        PortHandleRef(self.0).send(value)
    }

    pub fn send_exit(&self, reason: Value) -> bool {
        PortHandleRef(self.0).send_exit(reason)
    }

    pub fn owner(&self) -> Option<NonNull<Process>> {
        // SAFETY: alive per BorrowedPort contract.
        *unsafe { self.0.as_ref() }.owner.lock()
    }

    /// Drop one strong reference (the program-level `_decrementRef`).
    pub fn decrement_ref(self) {
        drop(PortHandle(self.0));
    }

    /// Add one strong reference (the program-level `_incrementRef`).
    pub fn increment_ref(&self) {
        // SAFETY: alive per BorrowedPort contract.
        unsafe { self.0.as_ref() }.refs.fetch_add(1, Ordering::AcqRel);
    }
}

/// Borrowed sender that reuses the handle plumbing without refcounting.
struct PortHandleRef(NonNull<Port>);

impl PortHandleRef {
    fn send(&self, value: Value) -> bool {
        let handle = core::mem::ManuallyDrop::new(PortHandle(self.0));
        handle.send(value)
    }

    fn send_exit(&self, reason: Value) -> bool {
        let handle = core::mem::ManuallyDrop::new(PortHandle(self.0));
        handle.send_exit(reason)
    }
}
