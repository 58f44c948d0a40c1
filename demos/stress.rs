//! Mixed-operation stress runs for both containers.
//!
//! Each run hammers a shared container from several threads and then checks
//! the structural guarantees that must hold afterwards: snapshots of the set
//! are strictly sorted, keys nobody removed are still present, and every
//! value pushed through the ring comes out exactly once, in per-producer
//! order.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};

use crossbeam_utils::thread;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use skipring::{RingBuffer, SkipSet};

const RUN_MILLIS: u64 = 500;

fn stress_set_small(num_threads: usize, limit: u32) {
    println!("stress_set_small({}, {})", num_threads, limit);

    let set = SkipSet::new();

    thread::scope(|scope| {
        for _ in 0..num_threads {
            let set = &set;
            scope.spawn(move |_| {
                let mut rng = thread_rng();
                let deadline = Instant::now() + Duration::from_millis(RUN_MILLIS);

                while Instant::now() < deadline {
                    for _ in 0..1000 {
                        let key = rng.gen_range(0..limit);

                        if rng.gen() {
                            set.insert(key);
                        } else {
                            set.remove(&key);
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    let snapshot: Vec<u32> = set.iter().collect();
    for w in snapshot.windows(2) {
        assert!(w[0] < w[1]);
    }
    assert_eq!(snapshot.len(), set.len());
}

fn stress_set_large(num_threads: usize, limit: u32) {
    println!("stress_set_large({}, {})", num_threads, limit);

    let mut nums: Vec<u32> = (0..limit).collect();
    nums.shuffle(&mut thread_rng());

    // The first half is inserted and kept; the second half is inserted and
    // then removed again by whichever thread picked it up.
    let keep = nums[..limit as usize / 2].to_vec();
    let churn = nums[limit as usize / 2..].to_vec();

    let set = SkipSet::new();
    let keep_work = Mutex::new(keep.clone());
    let churn_work = Mutex::new(churn);

    thread::scope(|scope| {
        for _ in 0..num_threads {
            let set = &set;
            let keep_work = &keep_work;
            let churn_work = &churn_work;
            scope.spawn(move |_| {
                while let Some(key) = keep_work.lock().pop() {
                    assert!(set.insert(key));
                }
                while let Some(key) = churn_work.lock().pop() {
                    assert!(set.insert(key));
                    assert!(set.remove(&key));
                }
            });
        }
    })
    .unwrap();

    let mut expected = keep;
    expected.sort_unstable();
    assert_eq!(set.iter().collect::<Vec<_>>(), expected);
}

fn stress_set_iter(num_threads: usize, limit: u32) {
    println!("stress_set_iter({}, {})", num_threads, limit);

    // Keys below `permanent` are never removed, so every snapshot must
    // contain all of them.
    let permanent = limit / 4;
    let set = SkipSet::new();
    for key in 0..permanent {
        set.insert(key);
    }

    let deadline = Instant::now() + Duration::from_millis(RUN_MILLIS);

    thread::scope(|scope| {
        for _ in 0..num_threads {
            let set = &set;
            scope.spawn(move |_| {
                let mut rng = thread_rng();

                while Instant::now() < deadline {
                    for _ in 0..1000 {
                        let key = rng.gen_range(permanent..limit);

                        if rng.gen() {
                            set.insert(key);
                        } else {
                            set.remove(&key);
                        }
                    }
                }
            });
        }

        let set = &set;
        scope.spawn(move |_| {
            while Instant::now() < deadline {
                let snapshot: Vec<u32> = set.iter().collect();
                for w in snapshot.windows(2) {
                    assert!(w[0] < w[1]);
                }

                let seen = snapshot.iter().filter(|&&key| key < permanent).count();
                assert_eq!(seen as u32, permanent);
            }
        });
    })
    .unwrap();
}

fn stress_ring(producers: u64, consumers: usize, per_producer: u64, capacity: usize) {
    println!(
        "stress_ring({}, {}, {}, {})",
        producers, consumers, per_producer, capacity
    );

    let rb = RingBuffer::with_capacity(capacity);
    let consumed = AtomicU64::new(0);
    let total = producers * per_producer;

    thread::scope(|scope| {
        for p in 0..producers {
            let rb = &rb;
            scope.spawn(move |_| {
                for i in 0..per_producer {
                    let mut value = p * per_producer + i;
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

        for _ in 0..consumers {
            let rb = &rb;
            let consumed = &consumed;
            scope.spawn(move |_| {
                let mut last_seen = vec![None::<u64>; producers as usize];

                while consumed.load(Relaxed) < total {
                    match rb.dequeue() {
                        Some(value) => {
                            let p = (value / per_producer) as usize;
                            // One producer's values arrive in the order it
                            // enqueued them.
                            if let Some(last) = last_seen[p] {
                                assert!(value > last);
                            }
                            last_seen[p] = Some(value);
                            consumed.fetch_add(1, Relaxed);
                        }
                        None => std::thread::yield_now(),
                    }
                }
            });
        }
    })
    .unwrap();

    assert_eq!(consumed.load(Relaxed), total);
    assert!(rb.is_empty());
}

fn main() {
    stress_set_small(8, 5);
    stress_set_small(8, 50);
    stress_set_small(16, 1000);

    stress_set_large(2, 10_000);
    stress_set_large(8, 50_000);

    stress_set_iter(2, 50);
    stress_set_iter(4, 1000);

    stress_ring(2, 1, 10_000, 4);
    stress_ring(4, 4, 10_000, 64);
    stress_ring(8, 2, 5_000, 1);
}
