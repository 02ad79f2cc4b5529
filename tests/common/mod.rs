/*
 * Test support: a process-wide runtime with a dispatcher that runs each
 * test body as a fibre and ships the result back to the harness thread.
 */

use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;

#[allow(dead_code)]
pub const TEST_WORKERS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

lazy_static::lazy_static! {
    static ref DISPATCH: Mutex<Sender<Job>> = {
        let (tx, rx) = channel::<Job>();
        let _ = std::thread::spawn(move || {
            let _ = env_logger::builder().is_test(true).try_init();
            strand::bootstrap(1, TEST_WORKERS);
            // Poll with fibre-level sleeps so this worker stays available
            // to the scheduler between jobs.
            loop {
                match rx.try_recv() {
                    Ok(job) => {
                        strand::Fibre::spawn(job).detach();
                    }
                    Err(std::sync::mpsc::TryRecvError::Empty) => {
                        strand::sleep(std::time::Duration::from_millis(1));
                    }
                    Err(std::sync::mpsc::TryRecvError::Disconnected) => break,
                }
            }
        });
        Mutex::new(tx)
    };
}

/// Run `f` on a fibre inside the shared event scope and return its
/// result to the calling (non-runtime) test thread.
pub fn run_fibre<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (rtx, rrx) = channel();
    let job: Job = Box::new(move || {
        let _ = rtx.send(f());
    });
    DISPATCH
        .lock()
        .expect("dispatcher poisoned")
        .send(job)
        .expect("runtime dispatcher gone");
    rrx.recv().expect("test fibre finished without a result")
}
