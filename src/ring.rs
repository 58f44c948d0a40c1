//! A bounded multi-producer multi-consumer FIFO queue.
//!
//! The queue is a fixed array of atomic words. Each word is either a
//! sequence-tagged vacancy or a pointer to a published value; producers and
//! consumers claim positions with fetch-and-increment on a pair of monotonic
//! counters and then race a single compare-and-swap against the slot the
//! position maps to. No operation ever blocks on another thread: a position
//! held up by a stalled peer is flagged and abandoned, and the counters are
//! re-consulted for a fresh one.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::thread;
use std::time::Duration;

use crossbeam_epoch as epoch;
use crossbeam_utils::{Backoff as Spin, CachePadded};

/// Attempts per operation before reporting failure on a pathologically
/// contended interleaving.
const MAX_FAILS: usize = 1_000;

/// Number of low bits of a slot word reserved for tags.
const TAG_BITS: usize = 3;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

/// Delay mark: the position is stalled and peers should not wait for it.
const DELAY_MARK: usize = 0b001;

/// Discriminator: set for a vacancy, clear for a published value.
const EMPTY_BIT: usize = 0b010;

/// Reserved for operation descriptors of a helping scheme; never set here.
#[allow(dead_code)]
const HELP_BIT: usize = 0b100;

/// Heap header published into a slot: the sequence number stamped by the
/// enqueuer, followed by the caller's value.
///
/// `repr(C)` with the `u64` first guarantees the 8-byte alignment that the
/// tag encoding borrows from the pointer.
#[repr(C)]
struct Slab<T> {
    seq: u64,
    item: ManuallyDrop<T>,
}

/// Decoded view of a slot word.
enum SlotView<T> {
    /// Vacant, expecting the enqueue whose reservation equals `seq`.
    Empty { seq: u64, marked: bool },
    /// Occupied by a published value.
    Value { slab: *mut Slab<T>, marked: bool },
}

fn encode_empty(seq: u64) -> usize {
    ((seq as usize) << TAG_BITS) | EMPTY_BIT
}

fn encode_value<T>(slab: *mut Slab<T>) -> usize {
    let bits = slab as usize;
    assert_eq!(bits & TAG_MASK, 0, "slab allocation is not 8-byte aligned");
    bits
}

fn decode<T>(word: usize) -> SlotView<T> {
    let marked = word & DELAY_MARK != 0;
    if word & EMPTY_BIT != 0 {
        SlotView::Empty {
            seq: (word >> TAG_BITS) as u64,
            marked,
        }
    } else {
        SlotView::Value {
            slab: (word & !TAG_MASK) as *mut Slab<T>,
            marked,
        }
    }
}

/// A bounded lock-free FIFO queue.
///
/// Capacity is fixed at construction. Fullness and emptiness are judged by
/// the reservation counters, so both are advisory under concurrency: an
/// `enqueue` that returns `Err` saw the buffer full at some instant during
/// the call, and a `dequeue` that returns `None` saw it empty or found the
/// head position stalled.
pub struct RingBuffer<T> {
    /// Monotonic count of dequeue reservations.
    head: CachePadded<AtomicU64>,
    /// Monotonic count of enqueue reservations.
    tail: CachePadded<AtomicU64>,
    slots: Box<[AtomicUsize]>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a buffer holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, or if pointers are not 64 bits wide.
    pub fn with_capacity(capacity: usize) -> RingBuffer<T> {
        assert!(capacity > 0, "capacity must be positive");
        assert!(
            mem::size_of::<usize>() == mem::size_of::<u64>(),
            "tagged slots require a 64-bit target"
        );

        // Slot i starts out expecting the i-th enqueue; each consumed
        // cycle advances a slot's expectation by the full capacity.
        let slots = (0..capacity)
            .map(|seq| AtomicUsize::new(encode_empty(seq as u64)))
            .collect();

        RingBuffer {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots,
            _marker: PhantomData,
        }
    }

    /// Returns the maximum number of values the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the buffer looked full at some instant during the
    /// call.
    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(SeqCst);
        let head = self.head.load(SeqCst);
        tail.saturating_sub(head) >= self.slots.len() as u64
    }

    /// Returns `true` if the buffer looked empty at some instant during the
    /// call.
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.load(SeqCst);
        let head = self.head.load(SeqCst);
        head >= tail
    }

    #[inline]
    fn slot(&self, seq: u64) -> &AtomicUsize {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    /// Backs off while re-reading `slot`. Returns the new word if it changed
    /// and `None` if the wait was exhausted with the word intact.
    fn backoff_reread(slot: &AtomicUsize, expected: usize) -> Option<usize> {
        let spin = Spin::new();
        while !spin.is_completed() {
            spin.snooze();
            let word = slot.load(SeqCst);
            if word != expected {
                return Some(word);
            }
        }

        thread::sleep(Duration::from_micros(1));
        let word = slot.load(SeqCst);
        if word != expected {
            Some(word)
        } else {
            None
        }
    }

    /// Attempts to enqueue `value` at the back of the buffer.
    ///
    /// Returns the value if the buffer stays full for the whole call, or if
    /// the retry budget runs out.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut slab = Box::new(Slab {
            seq: 0,
            item: ManuallyDrop::new(value),
        });
        let mut fails = 0;

        loop {
            if self.is_full() {
                return Err(ManuallyDrop::into_inner(slab.item));
            }

            let t = self.tail.fetch_add(1, SeqCst);
            let slot = self.slot(t);

            loop {
                fails += 1;
                if fails >= MAX_FAILS {
                    return Err(ManuallyDrop::into_inner(slab.item));
                }

                let word = slot.load(SeqCst);
                match decode::<T>(word) {
                    SlotView::Empty { marked: true, .. } | SlotView::Value { marked: true, .. } => {
                        // Stalled position; abandon it for a fresh one.
                        break;
                    }
                    SlotView::Empty { seq, marked: false } => {
                        if seq > t {
                            // The slot already serves a later generation.
                            break;
                        }
                        if seq < t {
                            // An older enqueue still owes this vacancy.
                            // Give it a moment; if the word then still
                            // reads the same, claim the slot over it.
                            if Self::backoff_reread(slot, word).is_some() {
                                continue;
                            }
                        }

                        slab.seq = t;
                        let raw = Box::into_raw(slab);
                        match slot.compare_exchange(word, encode_value(raw), SeqCst, SeqCst) {
                            Ok(_) => return Ok(()),
                            Err(_) => {
                                slab = unsafe { Box::from_raw(raw) };
                                continue;
                            }
                        }
                    }
                    SlotView::Value { .. } => {
                        // A resident value; the counters decide whether
                        // that means the buffer is full.
                        break;
                    }
                }
            }
        }
    }

    /// Attempts to dequeue the value at the front of the buffer.
    ///
    /// Returns `None` if the buffer stays empty for the whole call, if the
    /// producer owing the front position has stalled, or if the retry budget
    /// runs out.
    pub fn dequeue(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut fails = 0;

        loop {
            if self.is_empty() {
                return None;
            }

            let h = self.head.fetch_add(1, SeqCst);
            let slot = self.slot(h);
            let next_empty = encode_empty(h + self.slots.len() as u64);

            loop {
                fails += 1;
                if fails >= MAX_FAILS {
                    return None;
                }

                let word = slot.load(SeqCst);
                match decode::<T>(word) {
                    SlotView::Value { slab, marked } => {
                        // The pin keeps the slab alive even if a faster
                        // consumer recycles the slot while we look at it.
                        let seq = unsafe { (*slab).seq };

                        if seq > h {
                            // Our reservation was skipped over.
                            break;
                        }

                        if seq == h {
                            // Carry a delay mark into the next cycle so it
                            // still reads as stalled.
                            let replacement = if marked {
                                next_empty | DELAY_MARK
                            } else {
                                next_empty
                            };
                            if slot
                                .compare_exchange(word, replacement, SeqCst, SeqCst)
                                .is_ok()
                            {
                                unsafe {
                                    let item = ManuallyDrop::take(&mut (*slab).item);
                                    guard.defer_unchecked(move || drop(Box::from_raw(slab)));
                                    return Some(item);
                                }
                            }
                            continue;
                        }

                        // A value stranded by an abandoned older cycle.
                        // Flag it so future cycles skip the position. The
                        // word may change under the fetch_or; a mark landing
                        // on a fresh word is carried along harmlessly.
                        if Self::backoff_reread(slot, word).is_some() {
                            continue;
                        }
                        slot.fetch_or(DELAY_MARK, SeqCst);
                        return None;
                    }
                    SlotView::Empty { seq, marked: false } => {
                        if seq > h {
                            break;
                        }

                        // The producer owing this position has not arrived
                        // yet. Wait briefly, then flag the position and
                        // report empty rather than block on the straggler.
                        if Self::backoff_reread(slot, word).is_some() {
                            continue;
                        }
                        slot.fetch_or(DELAY_MARK, SeqCst);
                        return None;
                    }
                    SlotView::Empty { seq, marked: true } => {
                        // A vacancy flagged in an earlier cycle: recycle it
                        // for a future generation and move on. Never move a
                        // slot's expectation backwards.
                        if seq <= h {
                            let _ = slot.compare_exchange(word, next_empty, SeqCst, SeqCst);
                        }
                        break;
                    }
                }
            }
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let SlotView::Value { slab, .. } = decode::<T>(*slot.get_mut()) {
                unsafe {
                    let mut slab = Box::from_raw(slab);
                    ManuallyDrop::drop(&mut slab.item);
                }
            }
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    /// Dumps the counters and the state of every slot.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = epoch::pin();

        let slots: Vec<String> = self
            .slots
            .iter()
            .map(|slot| {
                let word = slot.load(SeqCst);
                match decode::<T>(word) {
                    SlotView::Empty { seq, marked } => {
                        format!("empty seq={}{}", seq, if marked { " delayed" } else { "" })
                    }
                    SlotView::Value { slab, marked } => {
                        let seq = unsafe { (*slab).seq };
                        format!("value seq={}{}", seq, if marked { " delayed" } else { "" })
                    }
                }
            })
            .collect();

        f.debug_struct("RingBuffer")
            .field("capacity", &self.slots.len())
            .field("head", &self.head.load(SeqCst))
            .field("tail", &self.tail.load(SeqCst))
            .field("slots", &slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;

    use crossbeam_utils::thread;

    #[test]
    fn starts_empty() {
        let rb: RingBuffer<i32> = RingBuffer::with_capacity(4);
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        assert_eq!(rb.capacity(), 4);
        assert_eq!(rb.dequeue(), None);
    }

    #[test]
    #[should_panic]
    fn zero_capacity() {
        RingBuffer::<i32>::with_capacity(0);
    }

    #[test]
    fn full_buffer_rejects_then_accepts() {
        let rb = RingBuffer::with_capacity(4);
        for x in ['a', 'b', 'c', 'd'] {
            assert_eq!(rb.enqueue(x), Ok(()));
        }
        assert!(rb.is_full());
        assert_eq!(rb.enqueue('e'), Err('e'));

        assert_eq!(rb.dequeue(), Some('a'));
        assert_eq!(rb.enqueue('e'), Ok(()));

        assert_eq!(rb.dequeue(), Some('b'));
        assert_eq!(rb.dequeue(), Some('c'));
        assert_eq!(rb.dequeue(), Some('d'));
        assert_eq!(rb.dequeue(), Some('e'));
        assert!(rb.is_empty());
    }

    #[test]
    fn single_slot_cycles() {
        let rb = RingBuffer::with_capacity(1);
        assert_eq!(rb.enqueue('x'), Ok(()));
        assert_eq!(rb.enqueue('y'), Err('y'));

        assert_eq!(rb.dequeue(), Some('x'));
        assert_eq!(rb.dequeue(), None);

        assert_eq!(rb.enqueue('y'), Ok(()));
        assert_eq!(rb.dequeue(), Some('y'));
    }

    #[test]
    fn fifo_across_wraparound() {
        let rb = RingBuffer::with_capacity(8);
        for round in 0..5 {
            for i in 0..8 {
                assert_eq!(rb.enqueue(round * 8 + i), Ok(()));
            }
            assert!(rb.is_full());
            for i in 0..8 {
                assert_eq!(rb.dequeue(), Some(round * 8 + i));
            }
            assert!(rb.is_empty());
        }
    }

    #[test]
    fn stalled_position_gives_up() {
        let rb = RingBuffer::with_capacity(1);
        rb.slots[0].fetch_or(DELAY_MARK, SeqCst);
        assert_eq!(rb.enqueue(7), Err(7));
    }

    #[test]
    fn delay_marked_slot_is_skipped_and_recycled() {
        let rb = RingBuffer::with_capacity(2);
        assert_eq!(rb.enqueue('a'), Ok(()));
        assert_eq!(rb.enqueue('b'), Ok(()));

        // Flag the slot holding 'a' as if its producer had stalled.
        rb.slots[0].fetch_or(DELAY_MARK, SeqCst);

        // The mark survives consumption and the position stays flagged.
        assert_eq!(rb.dequeue(), Some('a'));
        assert_eq!(rb.dequeue(), Some('b'));

        // The next enqueue abandons the flagged position and publishes in
        // the other slot; the dequeue after it recycles the flagged one.
        assert_eq!(rb.enqueue('c'), Ok(()));
        assert_eq!(rb.dequeue(), Some('c'));

        // Once recycled, the slot serves new generations again.
        assert_eq!(rb.enqueue('d'), Ok(()));
        assert_eq!(rb.dequeue(), Some('d'));
    }

    #[test]
    fn drop_frees_resident_values() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let rb = RingBuffer::with_capacity(4);
            for _ in 0..3 {
                assert!(rb.enqueue(Tracked(drops.clone())).is_ok());
            }

            drop(rb.dequeue());
            assert_eq!(drops.load(Relaxed), 1);
        }
        assert_eq!(drops.load(Relaxed), 3);
    }

    #[test]
    fn debug_dump_lists_slots() {
        let rb = RingBuffer::with_capacity(2);
        rb.enqueue(1).ok();

        let dump = format!("{:?}", rb);
        assert!(dump.contains("RingBuffer"));
        assert!(dump.contains("value seq=0"));
        assert!(dump.contains("empty seq=1"));
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 250;

        let rb = RingBuffer::with_capacity(16);

        thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let rb = &rb;
                scope.spawn(move |_| {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        loop {
                            match rb.enqueue(value) {
                                Ok(()) => break,
                                Err(v) => value = v,
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }

            let rb = &rb;
            scope.spawn(move |_| {
                let mut last_seen = [None::<u64>; PRODUCERS as usize];
                let mut received = 0;

                while received < PRODUCERS * PER_PRODUCER {
                    match rb.dequeue() {
                        Some(value) => {
                            let p = (value / PER_PRODUCER) as usize;
                            // Values from one producer arrive in the order
                            // that producer enqueued them.
                            if let Some(last) = last_seen[p] {
                                assert!(value > last);
                            }
                            last_seen[p] = Some(value);
                            received += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            });
        })
        .unwrap();

        assert!(rb.is_empty());
    }

    #[test]
    fn concurrent_pairs_conserve_values() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let rb = RingBuffer::with_capacity(8);
        let consumed = AtomicUsize::new(0);
        let sum = AtomicUsize::new(0);

        thread::scope(|scope| {
            for t in 0..THREADS {
                let rb = &rb;
                scope.spawn(move |_| {
                    for i in 0..PER_THREAD {
                        let mut value = t * PER_THREAD + i;
                        loop {
                            match rb.enqueue(value) {
                                Ok(()) => break,
                                Err(v) => value = v,
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }

            for _ in 0..THREADS {
                let rb = &rb;
                let consumed = &consumed;
                let sum = &sum;
                scope.spawn(move |_| {
                    loop {
                        if consumed.load(Relaxed) >= THREADS * PER_THREAD {
                            break;
                        }
                        if let Some(value) = rb.dequeue() {
                            sum.fetch_add(value, Relaxed);
                            consumed.fetch_add(1, Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        })
        .unwrap();

        let total = THREADS * PER_THREAD;
        assert_eq!(consumed.load(Relaxed), total);
        assert_eq!(sum.load(Relaxed), total * (total - 1) / 2);
    }
}
