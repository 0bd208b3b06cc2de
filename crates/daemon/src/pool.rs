//! The worker pool with non-blocking dispatch.
//!
//! Dispatch never blocks the supervisor: when the task queue is full the
//! job is dropped. Under overload it is better to drop fresh work than to
//! queue it behind stale work and answer clients that gave up long ago.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::debug;

use crate::handler::SharedHandler;
use crate::worker::{self, Job};

/// Why a job could not be dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The task queue is full; the job was dropped by policy.
    #[error("worker pool task queue is full")]
    QueueFull,

    /// The pool has been closed.
    #[error("worker pool is not running")]
    Closed,
}

/// A fixed-size pool of worker threads serving jobs from a bounded queue.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers named `Worker-1` through `Worker-N`, each
    /// running the handler's per-worker init before serving jobs.
    pub fn start(
        size: usize,
        queue_capacity: usize,
        handler: Arc<SharedHandler>,
    ) -> io::Result<Self> {
        let (sender, receiver) = bounded(queue_capacity);

        let mut workers = Vec::with_capacity(size);
        for number in 1..=size {
            let receiver: Receiver<Job> = receiver.clone();
            let handler = Arc::clone(&handler);
            let worker = thread::Builder::new()
                .name(format!("Worker-{number}"))
                .spawn(move || worker_main(&handler, &receiver))?;
            workers.push(worker);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Hands a job to the pool without ever blocking. A full queue drops
    /// the job; the caller logs the drop.
    pub fn try_dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let Some(sender) = &self.sender else {
            return Err(DispatchError::Closed);
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }

    /// Stops accepting work and waits for the workers to finish their
    /// queued jobs.
    pub fn close(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_main(handler: &SharedHandler, receiver: &Receiver<Job>) {
    debug!("Worker starting");
    handler.worker_init();
    for job in receiver {
        worker::handle_job(handler, &job);
    }
    debug!("Worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::{DispatchError, WorkerPool};
    use crate::bundle::{IncomingPacketBundle, MessageId};
    use crate::handler::{HandlerError, MessageHandler, SharedHandler};
    use crate::listeners::Replier;
    use crate::worker::Job;
    use protocol::{DhcpOption, RelayMessage};
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_job() -> Job {
        let socket = Arc::new(UdpSocket::bind("[::1]:0").unwrap());
        Job {
            bundle: IncomingPacketBundle {
                message_id: MessageId::next(),
                data: vec![0x01, 0xab, 0xcd, 0xef],
                source_address: "fe80::babe".parse().unwrap(),
                link_address: "2001:db8::1".parse().unwrap(),
                interface_index: 0,
                received_over_multicast: false,
                received_over_tcp: false,
                marks: vec![],
                relay_options: vec![DhcpOption::InterfaceId(b"eth0".to_vec())],
            },
            replier: Replier::Udp(crate::listeners::udp::UdpReplier::with_ports(
                socket, 546, 547,
            )),
        }
    }

    /// Blocks inside `handle` until the gate opens, reporting when the
    /// job has been picked up.
    struct GatedHandler {
        started: crossbeam_channel::Sender<()>,
        gate: crossbeam_channel::Receiver<()>,
        handled: AtomicUsize,
    }

    impl MessageHandler for GatedHandler {
        fn handle(
            &self,
            _wrapped: &RelayMessage,
            _bundle: &IncomingPacketBundle,
        ) -> Result<Option<RelayMessage>, HandlerError> {
            let _ = self.started.send(());
            let _ = self.gate.recv();
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn overload_drops_instead_of_blocking() {
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let handler = Arc::new(GatedHandler {
            started: started_tx,
            gate: gate_rx,
            handled: AtomicUsize::new(0),
        });
        let shared = Arc::new(SharedHandler::new(handler.clone()));

        // One worker, queue capacity one.
        let pool = WorkerPool::start(1, 1, Arc::clone(&shared)).unwrap();

        // First job: picked up by the worker, which then blocks.
        pool.try_dispatch(test_job()).unwrap();
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("the worker never picked up the first job");

        // Second job fills the queue; the third must be refused at once.
        pool.try_dispatch(test_job()).unwrap();
        assert_eq!(
            pool.try_dispatch(test_job()),
            Err(DispatchError::QueueFull)
        );

        // Open the gate so both accepted jobs complete.
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        pool.close();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
    }

    struct CountingHandler {
        handled: AtomicUsize,
        inits: AtomicUsize,
    }

    impl MessageHandler for CountingHandler {
        fn worker_init(&self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn handle(
            &self,
            _wrapped: &RelayMessage,
            _bundle: &IncomingPacketBundle,
        ) -> Result<Option<RelayMessage>, HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn workers_run_the_init_hook_once_each() {
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
        });
        let shared = Arc::new(SharedHandler::new(handler.clone()));

        let pool = WorkerPool::start(3, 16, shared).unwrap();
        for _ in 0..5 {
            pool.try_dispatch(test_job()).unwrap();
        }
        pool.close();

        assert_eq!(handler.inits.load(Ordering::SeqCst), 3);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    }
}
