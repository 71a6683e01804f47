//! Counting-barrier fan-in.
//!
//! `fan_in(n, capacity)` hands out `n` contributors that feed one shared item
//! queue and one shared error queue. A supervisor task keeps the queues open
//! until every contributor has been dropped, then closes both exactly once and
//! flips the completion flag. No contributor can ever push into a closed queue.

use tokio::sync::{mpsc, watch};
use tracing::trace;

/// Producer side of a fan-in. Dropping it counts as completion.
pub struct Contributor<T, E> {
    items: Option<mpsc::Sender<T>>,
    errors: Option<mpsc::Sender<E>>,
    done: mpsc::UnboundedSender<()>,
}

impl<T, E> Contributor<T, E> {
    /// Waits for room in the item queue. Returns `false` once the receiving
    /// side has been dropped.
    pub async fn push(&self, item: T) -> bool {
        match &self.items {
            Some(items) => items.send(item).await.is_ok(),
            None => false,
        }
    }

    pub async fn fail(&self, err: E) -> bool {
        match &self.errors {
            Some(errors) => errors.send(err).await.is_ok(),
            None => false,
        }
    }
}

impl<T, E> Drop for Contributor<T, E> {
    fn drop(&mut self) {
        // release the queues before reporting completion
        self.items.take();
        self.errors.take();
        let _ = self.done.send(());
    }
}

/// Completion flag of a fan-in, set after both queues have been closed.
#[derive(Debug, Clone)]
pub struct Completion(watch::Receiver<bool>);

impl Completion {
    pub fn is_done(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Consumer side of a fan-in.
pub struct Merged<T, E> {
    pub items: mpsc::Receiver<T>,
    pub errors: mpsc::Receiver<E>,
    pub completion: Completion,
}

/// Builds a fan-in for `contributors` producers. The error queue holds one
/// error per contributor.
pub fn fan_in<T, E>(contributors: usize, capacity: usize) -> (Vec<Contributor<T, E>>, Merged<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (items_tx, items) = mpsc::channel(capacity.max(1));
    let (errors_tx, errors) = mpsc::channel(contributors.max(1));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let handles = (0..contributors)
        .map(|_| Contributor {
            items: Some(items_tx.clone()),
            errors: Some(errors_tx.clone()),
            done: done_tx.clone(),
        })
        .collect();
    drop(done_tx);

    tokio::spawn(async move {
        let mut finished = 0;
        while finished < contributors {
            if done_rx.recv().await.is_none() {
                break;
            }
            finished += 1;
        }
        drop(items_tx);
        drop(errors_tx);
        trace!(contributors, "fan-in complete");
        let _ = closed_tx.send(true);
    });

    (
        handles,
        Merged {
            items,
            errors,
            completion: Completion(closed_rx),
        },
    )
}
