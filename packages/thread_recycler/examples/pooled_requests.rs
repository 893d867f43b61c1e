//! A request wrapper that is reused instead of reallocated:
//!
//! * An acceptor thread obtains request objects from the pool and fills them in.
//! * Worker threads process the requests and recycle them when done.
//! * The recycled objects travel back to the acceptor and are reused for later requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use thread_recycler::{Handle, Recyclable, Recycler};

const REQUEST_COUNT: usize = 10_000;
const WORKER_COUNT: usize = 4;

struct Request {
    handle: Handle<Request>,
    path: String,
    body: Vec<u8>,
}

impl Recyclable for Request {
    fn handle(&self) -> &Handle<Self> {
        &self.handle
    }
}

impl Request {
    fn release(mut self) {
        self.path.clear();
        self.body.clear();

        let handle = self.handle.clone();
        handle
            .recycle(self)
            .expect("every request is recycled exactly once");
    }
}

fn main() {
    let allocated = Arc::new(AtomicUsize::new(0));

    let recycler = Recycler::new({
        let allocated = Arc::clone(&allocated);
        move |handle| {
            allocated.fetch_add(1, Ordering::Relaxed);

            Request {
                handle,
                path: String::with_capacity(256),
                body: Vec::with_capacity(4096),
            }
        }
    });

    let mut work_txs = Vec::new();
    let mut workers = Vec::new();

    for _ in 0..WORKER_COUNT {
        let (work_tx, work_rx) = mpsc::sync_channel::<Request>(64);
        work_txs.push(work_tx);

        workers.push(thread::spawn(move || {
            let mut bytes = 0;

            for request in work_rx {
                bytes += request.path.len() + request.body.len();
                request.release();
            }

            bytes
        }));
    }

    for index in 0..REQUEST_COUNT {
        let mut request = recycler.get();
        request.path.push_str("/items/");
        request.path.push_str(&index.to_string());
        request.body.extend_from_slice(b"payload");

        work_txs[index % WORKER_COUNT]
            .send(request)
            .expect("workers outlive the acceptor loop");
    }

    drop(work_txs);

    let bytes: usize = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker threads do not panic"))
        .sum();

    println!(
        "Processed {REQUEST_COUNT} requests ({bytes} bytes) using {} allocated request objects",
        allocated.load(Ordering::Relaxed)
    );
}
