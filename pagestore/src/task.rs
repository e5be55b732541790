//! Fan-out of per-partition work onto the shared thread pool.

use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use std::sync::Arc;

pub type TaskResult<R> = std::thread::Result<R>;

/// Run `task` once for every partition in `0..partitions` on the given thread pool and block
/// until all of them finished.
///
/// Results are returned in partition order. If any task panicked, the panic is resumed on the
/// caller once every task has completed.
pub fn fan_out<F, R>(thread_pool: &threadpool::ThreadPool, partitions: usize, task: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(u8) -> R + Send + Sync + 'static,
{
    let task = Arc::new(task);
    let slots: Arc<Mutex<Vec<Option<TaskResult<R>>>>> =
        Arc::new(Mutex::new((0..partitions).map(|_| None).collect()));
    let wg = WaitGroup::new();

    for partition in 0..partitions {
        let task = task.clone();
        let slots = slots.clone();
        let wg = wg.clone();
        thread_pool.execute(move || {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                task(partition as u8)
            }));
            slots.lock()[partition] = Some(res);
            drop(wg);
        });
    }
    wg.wait();

    let mut slots = slots.lock();
    let mut results = Vec::with_capacity(partitions);
    for slot in slots.drain(..) {
        // UNWRAP: every task fills its slot before dropping its wait group handle.
        match slot.unwrap() {
            Ok(res) => results.push(res),
            Err(err_payload) => std::panic::resume_unwind(err_payload),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::fan_out;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn results_in_partition_order() {
        let pool = threadpool::ThreadPool::new(3);
        let res = fan_out(&pool, 5, |p| p as usize * 10);
        assert_eq!(res, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn waits_for_all_tasks() {
        let pool = threadpool::ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        fan_out(&pool, 4, move |_| {
            std::thread::sleep(std::time::Duration::from_millis(10));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    #[should_panic(expected = "partition 2 failed")]
    fn panics_are_resumed() {
        let pool = threadpool::ThreadPool::new(2);
        fan_out(&pool, 3, |p| {
            if p == 2 {
                panic!("partition 2 failed");
            }
        });
    }
}
