use jobq_common::pgqueue;
use thiserror::Error;

/// Enumeration of errors that terminate the dispatch loop. Handler failures
/// are not here: they are routed through the queue's failure path and the
/// loop keeps going.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred while driving the queue")]
    QueueError(#[from] pgqueue::QueueError),
}
