//! The lock-free MPMC FIFO queue with dual-release element reclamation.

use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use crossbeam_utils::CachePadded;

use crate::counted::{AtomicCountedPtr, CountedPtr};

/// The reclamation handshake bit in an element's link counter.
///
/// The dequeuer that advances past an element and the user that declares the
/// element done each XOR this bit exactly once; whichever of the two observes
/// it already set arrived second and runs the release callback.
const RELEASE_BIT: u64 = 1 << 63;

/// The callback through which the queue returns elements to their owner.
///
/// Invoked exactly once per element, with the opaque argument passed at
/// construction. The callback must recycle the element's memory (e.g. into a
/// pool) rather than truly free it: queue operations may still perform
/// harmless reads from released elements (see [`Queue::dequeue`]).
pub type ReleaseFn = unsafe fn(arg: *mut (), el: NonNull<Element>);

#[inline]
fn assert_aligned(el: NonNull<Element>) {
    assert!(el.as_ptr() as usize & 0xF == 0, "element is not 16-byte aligned");
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Queue
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free multi-producer/multi-consumer FIFO queue of intrusive,
/// caller-owned elements.
///
/// The algorithm is the classic Michael & Scott non-blocking queue: one dummy
/// element is always reachable from `head`, producers link at `tail` and help
/// a lagging tail forward, consumers advance `head`. Both ends are
/// [`AtomicCountedPtr`] cells whose counters defeat the ABA problem. On top
/// of that, each element's link counter carries a one-bit rendezvous (bit 63)
/// that decides whether the dequeuer or the user performs the final release
/// of a node once *both* are done with it.
///
/// The queue performs no allocation. Elements are handed in by the caller and
/// handed back through the release callback; while an element is inside the
/// queue, the queue owns its link field and nothing else.
///
/// # Example
///
/// ```
/// use core::ptr::{self, NonNull};
///
/// use counted_cas::{Element, Queue};
///
/// unsafe fn recycle(_arg: *mut (), _el: NonNull<Element>) {
///     // a real callback returns the element to its pool
/// }
///
/// let dummy = Element::new();
/// let msg = Element::new();
///
/// unsafe {
///     let queue = Queue::new(NonNull::from(&dummy), recycle, ptr::null_mut());
///     queue.enqueue(NonNull::from(&msg));
///
///     let el = queue.dequeue().unwrap();
///     assert_eq!(el, NonNull::from(&msg));
///     queue.release_element(el);
/// }
/// ```
#[repr(C)]
pub struct Queue {
    releaser: CachePadded<Releaser>,
    head: CachePadded<AtomicCountedPtr<Element>>,
    tail: CachePadded<AtomicCountedPtr<Element>>,
}

/********** impl Send + Sync **********************************************************************/

// The raw callback argument is opaque to the queue; the constructor's
// contract requires callback and argument to be callable from any thread.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

/********** impl inherent *************************************************************************/

impl Queue {
    /// Creates a new queue with `dummy` as its initial (never user-visible)
    /// head element.
    ///
    /// The dummy's handshake bit is preset: it is consumed by the first
    /// dequeue without ever being returned to a user, so the dequeuer's
    /// single toggle must suffice to release it.
    ///
    /// # Safety
    ///
    /// `dummy` must point at a live [`Element`] that remains valid (readable)
    /// for the lifetime of the queue and is not used with any other queue or
    /// stack. `release` and `arg` must be safe to invoke from any thread that
    /// operates on the queue.
    ///
    /// # Panics
    ///
    /// Panics if `dummy` is not 16-byte aligned.
    #[inline]
    pub unsafe fn new(dummy: NonNull<Element>, release: ReleaseFn, arg: *mut ()) -> Self {
        assert_aligned(dummy);
        dummy.as_ref().next.store(CountedPtr::new(ptr::null_mut(), RELEASE_BIT), Relaxed);

        let dummy = CountedPtr::new(dummy.as_ptr(), 0);
        Self {
            releaser: CachePadded::new(Releaser { release: Some(release), arg }),
            head: CachePadded::new(AtomicCountedPtr::new(dummy)),
            tail: CachePadded::new(AtomicCountedPtr::new(dummy)),
        }
    }

    /// Appends `el` at the tail of the queue and returns the upper-bound
    /// queue length (see [`queued`][Queue::queued]).
    ///
    /// # Safety
    ///
    /// `el` must point at a live, [reset][Element::reset] [`Element`] outside
    /// any queue, which remains readable for the lifetime of the queue. The
    /// queue owns the element's link field from this call until the element's
    /// release callback has run.
    ///
    /// # Panics
    ///
    /// Panics if `el` is misaligned, still carries a set handshake bit (it
    /// has been released but not yet reclaimed) or is already at the tail.
    #[inline]
    pub unsafe fn enqueue(&self, el: NonNull<Element>) -> i64 {
        assert_aligned(el);
        // sever any stale chain link; the counter half is stamped during the
        // enqueue loop
        let next = el.as_ref().next.load(Relaxed);
        el.as_ref().next.store(CountedPtr::new(ptr::null_mut(), next.ctr()), Relaxed);
        self.enqueue_chain(el)
    }

    /// Appends a null-terminated chain of elements (linked through
    /// [`Element::link`]) at the tail in one atomic splice and returns the
    /// upper-bound queue length.
    ///
    /// The whole chain becomes visible to consumers with a single successful
    /// CAS on the predecessor's link; the tail is then swung to the chain's
    /// last element, its counter advanced by the chain length.
    ///
    /// # Safety
    ///
    /// Every element of the chain must satisfy the contract of
    /// [`enqueue`][Queue::enqueue], and the chain must be null-terminated.
    ///
    /// # Panics
    ///
    /// Panics if any chain element is misaligned, linked to itself or still
    /// carries a set handshake bit, or if the chain head is already at the
    /// tail.
    pub unsafe fn enqueue_chain(&self, first: NonNull<Element>) -> i64 {
        let mut count = 1;
        let mut last = first;
        loop {
            assert_aligned(last);
            let next = last.as_ref().next.load(Relaxed);
            assert!(next.ctr() & RELEASE_BIT == 0, "element has not been reclaimed yet");
            match NonNull::new(next.ptr()) {
                None => break,
                Some(next) => {
                    assert!(next != last, "chain links an element to itself");
                    count += 1;
                    last = next;
                }
            }
        }

        loop {
            let tail = self.tail.load(Acquire);
            // may read from an element that has already been released, which
            // is harmless: the CAS below fails on any stale observation
            let next = (*tail.ptr()).next.load(Acquire);
            assert!(tail.ptr() != first.as_ptr(), "element is already at the tail");

            // the tail moved between the two loads, start over
            if tail != self.tail.load(Acquire) {
                continue;
            }

            if next.is_null() {
                // Stamp the chain's terminating null link with the tail's
                // current counter. A freshly reset element holds (null, 0),
                // which a parked observer from an earlier life of this cell
                // could mistake for its own expected value; the stamp makes
                // such a stale CAS fail.
                last.as_ref().next.store(CountedPtr::new(ptr::null_mut(), tail.ctr()), Relaxed);

                if (*tail.ptr()).next.compare_and_swap(next, first.as_ptr(), 1) {
                    // swing the tail to the chain's last element; a failure
                    // means another thread has already helped it forward
                    let _ = self.tail.compare_and_swap(tail, last.as_ptr(), count);
                    return self.queued();
                }
            } else {
                // the tail is lagging behind the true last element, help it
                let _ = self.tail.compare_and_swap(tail, next.ptr(), 1);
            }
        }
    }

    /// Removes and returns the element at the head of the queue, or [`None`]
    /// if the queue is observed empty.
    ///
    /// The returned element takes over the dummy role: the queue keeps it
    /// linked as the head sentinel until the *next* dequeue advances past it.
    /// The caller may read its payload and must eventually hand it back via
    /// [`release_element`][Queue::release_element], but must not touch the
    /// link field.
    ///
    /// # Safety
    ///
    /// The head element's link is read before the CAS that claims it, so it
    /// may be read after a concurrent dequeue has already released that
    /// element. The stale observation is caught by the subsequent CAS, but
    /// the read itself requires the release callback to keep element memory
    /// readable (pool/slab recycling) instead of returning it to the OS.
    pub unsafe fn dequeue(&self) -> Option<NonNull<Element>> {
        loop {
            let head = self.head.load(Acquire);
            let tail = self.tail.load(Acquire);
            let next = (*head.ptr()).next.load(Acquire);

            // the head moved between the two loads, start over
            if head != self.head.load(Acquire) {
                continue;
            }

            if next.is_null() || head.ptr() == tail.ptr() {
                if next.is_null() {
                    return None;
                }
                // head caught up with a lagging tail, help it before retrying
                let _ = self.tail.compare_and_swap(tail, next.ptr(), 1);
            } else if self.head.compare_and_swap(head, next.ptr(), 1) {
                // the old dummy has been advanced past; run the dequeuer's
                // half of its release handshake
                self.release(NonNull::new_unchecked(head.ptr()));
                return Some(NonNull::new_unchecked(next.ptr()));
            }
        }
    }

    /// Declares the caller done with a dequeued element: the user's half of
    /// the reclamation handshake.
    ///
    /// The element's release callback fires exactly once, at this call or at
    /// the dequeue that advances past the element, whichever happens second.
    ///
    /// # Safety
    ///
    /// `el` must have been returned by [`dequeue`][Queue::dequeue] on this
    /// queue and must be released exactly once.
    ///
    /// # Panics
    ///
    /// Panics if `el` is misaligned or the queue has already been torn down.
    #[inline]
    pub unsafe fn release_element(&self, el: NonNull<Element>) {
        assert_aligned(el);
        self.release(el);
    }

    /// One half of the two-party rendezvous on bit 63 of the element's link
    /// counter. Exactly one of the two XORs sets the bit and exactly one
    /// clears it again; the party that observes it already set arrived second
    /// and reclaims the element.
    #[inline]
    unsafe fn release(&self, el: NonNull<Element>) {
        let prev = el.as_ref().next.fetch_xor_ctr(RELEASE_BIT, AcqRel);
        if prev & RELEASE_BIT != 0 {
            self.invoke_releaser(el);
        }
    }

    #[inline]
    unsafe fn invoke_releaser(&self, el: NonNull<Element>) {
        let release = match self.releaser.release {
            Some(release) => release,
            None => panic!("element released on a queue that has been torn down"),
        };
        release(self.releaser.arg, el);
    }

    /// Returns `true` if the queue is observed empty.
    ///
    /// Purely advisory and stale by design: the observation reads the head
    /// and then the head element's link without verifying the head has not
    /// moved in between. A torn-down queue reads as empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Acquire);
        match NonNull::new(head.ptr()) {
            // the dummy's link is readable even if the dummy has already been
            // released, per the pool contract on the release callback
            Some(dummy) => unsafe { dummy.as_ref() }.next.load(Acquire).is_null(),
            None => true,
        }
    }

    /// Returns the difference between the number of successful tail and head
    /// updates: an upper bound on the number of queued elements.
    ///
    /// The bound is advisory. The two counters are sampled independently, so
    /// the true length may be smaller at any moment (a producer's tail swing
    /// can lag its successful link CAS) and the difference can even be
    /// transiently negative.
    #[inline]
    pub fn queued(&self) -> i64 {
        let tail = self.tail.load(Relaxed);
        let head = self.head.load(Relaxed);
        tail.ctr().wrapping_sub(head.ctr()) as i64
    }

    /// Tears the queue down: drains all remaining elements (including the
    /// current dummy), invoking the release callback directly for each, then
    /// zeroes the head, tail and callback metadata.
    ///
    /// Drained elements bypass the handshake: they were never returned to a
    /// user, so the queue holds the only claim on them.
    ///
    /// # Safety
    ///
    /// No producer or consumer may be active; the exclusive borrow encodes
    /// that contract but cannot enforce it across raw aliases the caller may
    /// have kept.
    pub unsafe fn free(&mut self) {
        loop {
            let head = self.head.load(Relaxed);
            let el = match NonNull::new(head.ptr()) {
                Some(el) => el,
                None => break,
            };
            let next = el.as_ref().next.load(Relaxed);
            if self.head.compare_and_swap(head, next.ptr(), 1) {
                self.invoke_releaser(el);
            }
        }

        self.head.store(CountedPtr::null(), Relaxed);
        self.tail.store(CountedPtr::null(), Relaxed);
        *self.releaser = Releaser { release: None, arg: ptr::null_mut() };
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Queue {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Queue").field("head", &*self.head).field("tail", &*self.tail).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Releaser
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The release callback and its opaque argument, written once at
/// construction and cleared at teardown.
struct Releaser {
    release: Option<ReleaseFn>,
    arg: *mut (),
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Element
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The intrusive link embedded in every type that passes through a [`Queue`].
///
/// The link's pointer half connects the element to its successor; the counter
/// half carries the reclamation handshake bit (bit 63) and, while the pointer
/// half is null, an ABA disambiguator stamped by the enqueue loop (bits
/// 0–62). Embedders must not touch the link while the element is inside a
/// queue, i.e. from enqueue until the release callback has run; the bytes
/// after the link belong to the embedder at all times.
#[derive(Debug)]
#[repr(C)]
pub struct Element {
    next: AtomicCountedPtr<Element>,
}

/********** impl inherent *************************************************************************/

impl Element {
    /// Creates a new unlinked element.
    #[inline]
    pub const fn new() -> Self {
        Self { next: AtomicCountedPtr::null() }
    }

    /// Clears the link counter, making the element fit for (re-)enqueueing.
    ///
    /// Must be called each time the element (re-)enters circulation, i.e.
    /// before its first enqueue and whenever a pool recycles it.
    ///
    /// # Safety
    ///
    /// The element must be outside any queue; the queue owns the link of
    /// every element it holds, from enqueue until the element's release
    /// callback has run.
    #[inline]
    pub unsafe fn reset(&self) {
        let next = self.next.load(Relaxed);
        self.next.store(CountedPtr::new(next.ptr(), 0), Relaxed);
    }

    /// Links this element to `next`, building a chain for
    /// [`Queue::enqueue_chain`].
    ///
    /// # Safety
    ///
    /// The element must be outside any queue; the queue owns the link of
    /// every element it holds.
    #[inline]
    pub unsafe fn link(&self, next: *mut Element) {
        let cur = self.next.load(Relaxed);
        self.next.store(CountedPtr::new(next, cur.ctr()), Relaxed);
    }
}

/********** impl Default **************************************************************************/

impl Default for Element {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::{self, NonNull};
    use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering::Relaxed};

    use super::{Element, Queue};

    #[repr(C)]
    struct Msg {
        el: Element,
        value: AtomicI64,
    }

    impl Msg {
        fn new() -> Self {
            Self { el: Element::new(), value: AtomicI64::new(0) }
        }

        unsafe fn from_element(el: NonNull<Element>) -> NonNull<Msg> {
            el.cast()
        }
    }

    /// Counts callback invocations through the opaque argument.
    unsafe fn count_release(arg: *mut (), _el: NonNull<Element>) {
        (*(arg as *const AtomicUsize)).fetch_add(1, Relaxed);
    }

    fn frees(counter: &AtomicUsize) -> usize {
        counter.load(Relaxed)
    }

    #[test]
    fn empty_queue_reports_absence() {
        let dummy = Msg::new();
        let counter = AtomicUsize::new(0);
        let queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        assert!(unsafe { queue.dequeue() }.is_none());
        assert!(queue.is_empty());
        assert_eq!(queue.queued(), 0);
        assert_eq!(frees(&counter), 0);
    }

    #[test]
    fn fifo_order_is_preserved() {
        const N: usize = 1_000;

        let dummy = Msg::new();
        let msgs: Vec<_> = (0..N).map(|_| Msg::new()).collect();
        let counter = AtomicUsize::new(0);
        let mut queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        unsafe {
            for (i, msg) in msgs.iter().enumerate() {
                msg.value.store(1 + i as i64, Relaxed);
                queue.enqueue(NonNull::from(&msg.el));
            }
            assert_eq!(queue.queued(), N as i64);

            for i in 0..N {
                let el = queue.dequeue().unwrap();
                let msg = Msg::from_element(el);
                assert_eq!(msg.as_ref().value.load(Relaxed), 1 + i as i64);
                queue.release_element(el);
            }
        }

        // every element except the current dummy (the last message) has
        // completed both halves of its handshake
        assert_eq!(frees(&counter), N);
        assert!(queue.is_empty());
        assert_eq!(queue.queued(), 0);

        unsafe { queue.free() };
        assert_eq!(frees(&counter), N + 1);
    }

    #[test]
    fn chain_enqueue_preserves_chain_order() {
        let dummy = Msg::new();
        let msgs: Vec<_> = (0..5).map(|_| Msg::new()).collect();
        let counter = AtomicUsize::new(0);
        let queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        unsafe {
            for (i, msg) in msgs.iter().enumerate() {
                msg.value.store(i as i64, Relaxed);
                let next = match msgs.get(i + 1) {
                    Some(next) => &next.el as *const Element as *mut Element,
                    None => ptr::null_mut(),
                };
                msg.el.link(next);
            }

            let len = queue.enqueue_chain(NonNull::from(&msgs[0].el));
            assert_eq!(len, 5);
            assert_eq!(queue.queued(), 5);

            for i in 0..5 {
                let el = queue.dequeue().unwrap();
                assert_eq!(Msg::from_element(el).as_ref().value.load(Relaxed), i as i64);
                queue.release_element(el);
            }
            assert!(queue.dequeue().is_none());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn late_release_fires_callback_exactly_once() {
        let dummy = Msg::new();
        let msgs: Vec<_> = (0..3).map(|_| Msg::new()).collect();
        let counter = AtomicUsize::new(0);
        let queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        unsafe {
            for msg in &msgs {
                queue.enqueue(NonNull::from(&msg.el));
            }

            let first = queue.dequeue().unwrap();
            assert_eq!(frees(&counter), 1); // the initial dummy

            // two further dequeues advance past `first` without the user
            // having released it; its callback must wait for the release
            let second = queue.dequeue().unwrap();
            let third = queue.dequeue().unwrap();
            assert_eq!(frees(&counter), 1);

            queue.release_element(first);
            assert_eq!(frees(&counter), 2);

            queue.release_element(second);
            assert_eq!(frees(&counter), 3);
            queue.release_element(third);
            assert_eq!(frees(&counter), 3); // third is the current dummy
        }
    }

    #[test]
    fn teardown_drains_remaining_elements() {
        let dummy = Msg::new();
        let msgs: Vec<_> = (0..3).map(|_| Msg::new()).collect();
        let counter = AtomicUsize::new(0);
        let mut queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        unsafe {
            for msg in &msgs {
                queue.enqueue(NonNull::from(&msg.el));
            }
            queue.free();
        }

        assert_eq!(frees(&counter), 4);
        assert!(queue.is_empty());
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    #[should_panic]
    fn misaligned_element_is_rejected() {
        #[repr(C, align(16))]
        struct Slab {
            bytes: [u8; 64],
        }

        let dummy = Msg::new();
        let counter = AtomicUsize::new(0);
        let queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        let slab = Slab { bytes: [0; 64] };
        let misaligned = unsafe { slab.bytes.as_ptr().add(8) } as *mut Element;
        unsafe { queue.enqueue(NonNull::new_unchecked(misaligned)) };
    }

    #[test]
    #[should_panic]
    fn reenqueue_before_reclamation_is_rejected() {
        let dummy = Msg::new();
        let msg = Msg::new();
        let counter = AtomicUsize::new(0);
        let queue = unsafe {
            Queue::new(
                NonNull::from(&dummy.el),
                count_release,
                &counter as *const _ as *mut (),
            )
        };

        unsafe {
            queue.enqueue(NonNull::from(&msg.el));
            let el = queue.dequeue().unwrap();
            queue.release_element(el);
            // the element's handshake bit is still set (the queue holds it as
            // the current dummy), re-enqueueing it now would corrupt the chain
            queue.enqueue(el);
        }
    }
}
