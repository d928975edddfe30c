/// Something that can be drained and held quiescent while a caller edits
/// shared structure.
pub trait BarrierLockable {
    /// Blocks until no job is running, then keeps new jobs from starting.
    fn barrier_lock(&self);

    /// Takes the barrier only if nothing is queued or running.
    fn try_barrier_lock(&self) -> bool;

    fn unlock(&self);
}

/// Holds a barrier lock for its lifetime and releases it on every exit path,
/// unwinding included.
#[must_use = "the barrier is released as soon as the locker is dropped"]
pub struct BarrierLocker<'a, L: BarrierLockable + ?Sized> {
    lockable: &'a L,
}

impl<'a, L: BarrierLockable + ?Sized> BarrierLocker<'a, L> {
    pub fn new(lockable: &'a L) -> Self {
        lockable.barrier_lock();
        Self { lockable }
    }

    pub fn try_new(lockable: &'a L) -> Option<Self> {
        lockable
            .try_barrier_lock()
            .then_some(Self { lockable })
    }
}

impl<L: BarrierLockable + ?Sized> Drop for BarrierLocker<'_, L> {
    fn drop(&mut self) {
        self.lockable.unlock();
    }
}
