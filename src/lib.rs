//! Concurrent containers: an ordered set backed by an optimistic
//! fine-grained-locking skip list, and a bounded FIFO queue backed by a
//! fixed-capacity ring buffer of tagged atomic words.
//!
//! The two structures are independent; they share only the retry/backoff
//! conventions and the epoch-based reclamation of memory that lock-free
//! readers may still be traversing.

mod backoff;
mod base;

pub mod ring;
pub mod set;

pub use ring::RingBuffer;
pub use set::SkipSet;
