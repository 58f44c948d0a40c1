//! Rough throughput numbers for both containers.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use skipring::{RingBuffer, SkipSet};

const OPS: u64 = 1_000_000;

fn bench_set_insert(num_threads: u64) {
    let set = Arc::new(SkipSet::new());
    let start = Instant::now();

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let set = set.clone();
            thread::spawn(move || {
                let mut num = t;
                for _ in 0..OPS / num_threads {
                    num = num.wrapping_mul(17).wrapping_add(255);
                    set.insert(num);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    println!(
        "set insert, {} threads: {:.3} seconds ({} keys)",
        num_threads,
        start.elapsed().as_secs_f64(),
        set.len()
    );
}

fn bench_set_contains(num_threads: u64) {
    let set = Arc::new(SkipSet::new());
    for key in 0..100_000u64 {
        set.insert(key);
    }
    let start = Instant::now();

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let set = set.clone();
            thread::spawn(move || {
                let mut num = t;
                let mut hits = 0u64;
                for _ in 0..OPS / num_threads {
                    num = num.wrapping_mul(17).wrapping_add(255);
                    if set.contains(&(num % 200_000)) {
                        hits += 1;
                    }
                }
                hits
            })
        })
        .collect();
    let hits: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    println!(
        "set contains, {} threads: {:.3} seconds ({} hits)",
        num_threads,
        start.elapsed().as_secs_f64(),
        hits
    );
}

fn bench_ring(pairs: u64) {
    let rb = Arc::new(RingBuffer::with_capacity(1024));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..pairs {
        let rb_prod = Arc::clone(&rb);
        handles.push(thread::spawn(move || {
            for i in 0..OPS / pairs {
                let mut value = i;
                loop {
                    match rb_prod.enqueue(value) {
                        Ok(()) => break,
                        Err(v) => value = v,
                    }
                }
            }
        }));

        let rb = Arc::clone(&rb);
        handles.push(thread::spawn(move || {
            let mut taken = 0;
            while taken < OPS / pairs {
                if rb.dequeue().is_some() {
                    taken += 1;
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    println!(
        "ring, {} producer/consumer pairs: {:.3} seconds ({} values)",
        pairs,
        start.elapsed().as_secs_f64(),
        OPS
    );
}

fn main() {
    bench_set_insert(1);
    bench_set_insert(4);
    bench_set_contains(4);
    bench_ring(1);
    bench_ring(4);
}
