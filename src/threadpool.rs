//! Thread pool (spec.md §1 external collaborator, §5 concurrency model):
//! "run `job(i)` for i∈[0,N) and wait". The teacher crate explicitly omits
//! threading ("Note: Threading fields omitted as per AGENTS.md
//! (single-threaded only)" in `context.rs`), so the default pool here
//! executes inline exactly as spec.md says `nthreads==1` must, and the
//! scoped pool is a thin `std::thread::scope` fan-out for `nthreads > 1` —
//! no new dependency, since nothing in the example pack reaches for a
//! thread-pool crate at this crate's scale (lz4r uses `crossbeam-channel`
//! but for a CLI's multi-file pipeline, a different problem shape).

/// Runs `njobs` independent jobs, keyed by index, and returns only after all
/// complete (spec.md §5). Jobs are leaves: they must not re-enter the pool.
pub trait ThreadPool {
    fn run(&self, njobs: usize, job: impl Fn(usize) + Sync);
}

/// `nthreads == 1`: executes inline, in order (spec.md §5 "passing
/// nthreads==1 executes inline").
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialPool;

impl ThreadPool for SequentialPool {
    fn run(&self, njobs: usize, job: impl Fn(usize) + Sync) {
        for i in 0..njobs {
            job(i);
        }
    }
}

/// A fork-join pool of a fixed worker count, built from `std::thread::scope`
/// so jobs borrowing context-local scratch (spec.md §5 "a per-context arena
/// ... not shared across threads") stay sound without `Arc`/`'static`.
#[derive(Debug, Clone, Copy)]
pub struct ScopedPool {
    pub nthreads: usize,
}

impl ScopedPool {
    pub fn new(nthreads: usize) -> Self {
        ScopedPool { nthreads: nthreads.max(1) }
    }
}

impl ThreadPool for ScopedPool {
    fn run(&self, njobs: usize, job: impl Fn(usize) + Sync) {
        if self.nthreads <= 1 || njobs <= 1 {
            for i in 0..njobs {
                job(i);
            }
            return;
        }
        let workers = self.nthreads.min(njobs);
        std::thread::scope(|scope| {
            for w in 0..workers {
                let job = &job;
                scope.spawn(move || {
                    let mut i = w;
                    while i < njobs {
                        job(i);
                        i += workers;
                    }
                });
            }
        });
    }
}

/// Picks the pool implied by an `nthreads` parameter (spec.md §5 "a default
/// pool of size `nthreads` is created lazily").
pub fn pool_for(nthreads: usize) -> ScopedPool {
    ScopedPool::new(nthreads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sequential_pool_runs_all_jobs_in_order() {
        let seen = std::sync::Mutex::new(Vec::new());
        SequentialPool.run(5, |i| seen.lock().unwrap().push(i));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn scoped_pool_runs_every_job_exactly_once() {
        let counters: Vec<AtomicUsize> = (0..37).map(|_| AtomicUsize::new(0)).collect();
        let pool = ScopedPool::new(4);
        pool.run(37, |i| {
            counters[i].fetch_add(1, Ordering::SeqCst);
        });
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn scoped_pool_with_one_thread_matches_sequential() {
        let pool = ScopedPool::new(1);
        let seen = std::sync::Mutex::new(Vec::new());
        pool.run(4, |i| seen.lock().unwrap().push(i));
        let mut v = seen.lock().unwrap().clone();
        v.sort_unstable();
        assert_eq!(v, vec![0, 1, 2, 3]);
    }
}
