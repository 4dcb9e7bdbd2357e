//! A lock-free multi-producer/multi-consumer FIFO queue and its companion
//! LIFO stack, both built on a double-wide compare-and-swap that carries a
//! monotonic 64-bit counter alongside each pointer.
//!
//! The queue implements the non-blocking algorithm by Michael & Scott,
//! extended with a one-bit reclamation handshake between the dequeuer and the
//! end user: a dequeued element is handed to the caller while the queue still
//! holds it as the head sentinel, and its release callback fires only once
//! both parties are done with it, in whichever order they finish.
//!
//! Neither structure allocates. Nodes are intrusive and caller-owned: callers
//! embed an [`Element`] (queue) or [`StackEntry`] (stack) in their own types,
//! pass raw node addresses in, and receive them back through [`Queue::dequeue`],
//! [`Stack::pop`] and the queue's release callback. The counter half of every
//! [`AtomicCountedPtr`] cell advances on each successful update, which is
//! what defends the algorithms against the ABA problem without locks, epochs
//! or hazard pointers.
//!
//! Both structures are safe to use across processes, provided the roots, the
//! nodes and everything the release callback touches live in shared memory.
//!
//! # Reclamation contract
//!
//! The queue and the stack may read the link field of a node that has already
//! been handed back through the release callback; the counted CAS detects the
//! staleness and retries. Such reads are harmless only as long as node memory
//! remains readable, so release callbacks must recycle nodes (pool, slab,
//! free list) rather than return their memory to the operating system.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

mod counted;
mod queue;
mod stack;

pub use crate::counted::{AtomicCountedPtr, CountedPtr};
pub use crate::queue::{Element, Queue, ReleaseFn};
pub use crate::stack::{Stack, StackEntry};
