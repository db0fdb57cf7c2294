use crate::capacity_gate::{CapacityGate, Permit};

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A unit of work accepted by a named pool.
pub(crate) struct Job {
  pub(crate) task_id: u64,
  pub(crate) future: BoxFuture<'static, ()>,
}

/// A job paired with the gate permit it holds.
///
/// Unlike a plain queue slot, the permit is handed to the worker together with the job and is
/// only released once the job has finished running. A pool's gate therefore bounds queued and
/// running jobs together.
struct QueueMessage {
  job: Job,
  permit: Permit,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.job.task_id)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueError {
  /// Every permit is held and the caller asked not to wait.
  Full,
  Closed,
}

/// A bounded multi-producer, single-consumer queue of pool jobs over an unbounded
/// `fibre::mpsc` channel.
pub(crate) struct TaskQueue {
  tx: AsyncSender<QueueMessage>,
  rx: AsyncReceiver<QueueMessage>,
  gate: Arc<CapacityGate>,
}

impl TaskQueue {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      tx,
      rx,
      gate: Arc::new(CapacityGate::new(capacity)),
    }
  }

  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        tx: self.tx,
        gate: self.gate,
      },
      QueueConsumer { rx: self.rx },
    )
  }
}

#[derive(Clone)]
pub(crate) struct QueueProducer {
  tx: AsyncSender<QueueMessage>,
  gate: Arc<CapacityGate>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("gate", &self.gate)
      .finish_non_exhaustive()
  }
}

pub(crate) struct QueueConsumer {
  rx: AsyncReceiver<QueueMessage>,
}

impl QueueProducer {
  /// Sends a job, waiting for a permit while the pool is full.
  ///
  /// Gives up with `QueueError::Closed` if `closing` fires while waiting.
  pub(crate) async fn send(&self, job: Job, closing: &CancellationToken) -> Result<(), QueueError> {
    if closing.is_cancelled() || self.tx.is_closed() {
      return Err(QueueError::Closed);
    }
    let permit = tokio::select! {
      biased;
      _ = closing.cancelled() => return Err(QueueError::Closed),
      permit = self.gate.acquire() => permit,
    };
    self.push(job, permit).await
  }

  /// Sends a job only if a permit is immediately available.
  pub(crate) async fn try_send(&self, job: Job) -> Result<(), QueueError> {
    if self.tx.is_closed() {
      return Err(QueueError::Closed);
    }
    match self.gate.try_acquire() {
      Some(permit) => self.push(job, permit).await,
      None => Err(QueueError::Full),
    }
  }

  async fn push(&self, job: Job, permit: Permit) -> Result<(), QueueError> {
    // On failure the message, and with it the permit, is dropped here.
    self
      .tx
      .send(QueueMessage { job, permit })
      .await
      .map_err(|_| QueueError::Closed)
  }

  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Jobs accepted but not yet picked up by the worker loop.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  pub(crate) fn gate(&self) -> &Arc<CapacityGate> {
    &self.gate
  }
}

impl QueueConsumer {
  /// Receives the next job along with the permit it must hold until it finishes.
  pub(crate) async fn recv(&self) -> Result<(Job, Permit), RecvError> {
    let message = self.rx.recv().await?;
    Ok((message.job, message.permit))
  }
}
