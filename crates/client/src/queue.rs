//! FIFO mutation queue.
//!
//! Queued mutations are handed to a single worker future, which sends the
//! next one only after the previous response arrived. The server therefore
//! observes them in call order.

use futures::channel::{mpsc, oneshot};
use futures::future;
use futures::StreamExt;
use std::rc::Rc;
use tidal_core::{FunctionPath, RequestError, Value};
use tidal_reactive::{ResponseFuture, Scheduler, SubscriptionManager};
use tracing::{debug, trace};

struct QueuedMutation {
    path: FunctionPath,
    args: Value,
    reply: oneshot::Sender<Result<Value, RequestError>>,
}

/// Sender side of the mutation queue. Dropping it stops the worker once the
/// already queued mutations are sent.
pub(crate) struct MutationQueue {
    sender: mpsc::UnboundedSender<QueuedMutation>,
}

impl MutationQueue {
    /// Spawns the worker on `scheduler`.
    pub(crate) fn start(manager: Rc<dyn SubscriptionManager>, scheduler: &dyn Scheduler) -> Self {
        let (sender, mut receiver) = mpsc::unbounded::<QueuedMutation>();
        scheduler.spawn(Box::pin(async move {
            while let Some(mutation) = receiver.next().await {
                trace!(path = %mutation.path, "Sending queued mutation");
                let result = manager.mutation(&mutation.path, mutation.args).await;
                let _ = mutation.reply.send(result);
            }
            debug!("Mutation queue stopped");
        }));
        Self { sender }
    }

    /// Appends a mutation and returns its response.
    pub(crate) fn enqueue(&self, path: FunctionPath, args: Value) -> ResponseFuture {
        let (reply, response) = oneshot::channel();
        let mutation = QueuedMutation { path, args, reply };
        if self.sender.unbounded_send(mutation).is_err() {
            return Box::pin(future::ready(Err(RequestError::Transport(
                "mutation queue stopped".into(),
            ))));
        }
        Box::pin(async move {
            response
                .await
                .unwrap_or_else(|_| Err(RequestError::Transport("mutation dropped".into())))
        })
    }
}
