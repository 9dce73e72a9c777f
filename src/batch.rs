// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Batched exchange: coalesce queries through one HTTP client.
//!
//! Submissions land on a bounded queue served by a single worker. Each
//! iteration the worker opens a short collection window, drains what
//! arrived up to the batch capacity, obtains one client for the whole
//! batch, and issues the queries concurrently, delivering every result
//! into its submitter's slot. The slots are what give
//! [`DohUpstream::batch_exchange`](crate::DohUpstream::batch_exchange) its
//! positional alignment.
//!
//! The worker starts on first use and ends when the upstream closes;
//! queries still queued at that point fail with the closed error rather
//! than hanging.

use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::upstream::Inner;

/// Submissions waiting for the worker; senders block when it is full.
const QUEUE_CAPACITY: usize = 32;

pub(crate) struct BatchRequest {
    pub(crate) request: Message,
    pub(crate) slot: oneshot::Sender<Result<Message>>,
}

/// Submits `requests` and rendezvouses each result back into its position.
pub(crate) async fn batch_exchange(
    inner: &Arc<Inner>,
    requests: Vec<Message>,
) -> Vec<Result<Message>> {
    let sender = match sender(inner) {
        Ok(sender) => sender,
        Err(_) => {
            return requests
                .iter()
                .map(|_| Err(ErrorKind::Closed.into()))
                .collect();
        }
    };

    let mut slots = Vec::with_capacity(requests.len());
    for request in requests {
        let (tx, rx) = oneshot::channel();
        match sender.send(BatchRequest { request, slot: tx }).await {
            Ok(()) => slots.push(Some(rx)),
            // the worker is gone; this slot fails, the rest still try
            Err(_) => slots.push(None),
        }
    }

    let mut results = Vec::with_capacity(slots.len());
    for slot in slots {
        let result = match slot {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(ErrorKind::Closed.into()),
            },
            None => Err(ErrorKind::Closed.into()),
        };
        results.push(result);
    }
    results
}

/// The queue sender, starting the worker on first use.
fn sender(inner: &Arc<Inner>) -> Result<mpsc::Sender<BatchRequest>> {
    let mut batch = inner.batch.lock().expect("batch queue poisoned");

    if let Some(sender) = &*batch {
        return Ok(sender.clone());
    }
    if inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(ErrorKind::Closed.into());
    }

    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    tokio::spawn(worker(Arc::clone(inner), rx));
    *batch = Some(tx.clone());
    Ok(tx)
}

/// Drops the queue sender; the worker drains what is left and stops.
pub(crate) fn shutdown(inner: &Arc<Inner>) {
    inner.batch.lock().expect("batch queue poisoned").take();
}

async fn worker(inner: Arc<Inner>, mut queue: mpsc::Receiver<BatchRequest>) {
    debug!("batch worker started");

    loop {
        // the window opens before the first request arrives, bounding the
        // whole collection phase
        let window_ends = Instant::now() + inner.batch_window;

        let first = match timeout_at(window_ends, queue.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(_) => continue,
        };

        let mut batch = vec![first];
        while batch.len() < inner.batch_capacity {
            match timeout_at(window_ends, queue.recv()).await {
                Ok(Some(request)) => batch.push(request),
                Ok(None) | Err(_) => break,
            }
        }

        // one client serves the whole batch
        let client = match inner.get_client().await {
            Ok((client, _)) => client,
            Err(err) => {
                warn!(error = %err, "batch client init failed");
                for BatchRequest { slot, .. } in batch {
                    let _ = slot.send(Err(replicate_client_error(&err)));
                }
                continue;
            }
        };

        let mut in_flight = JoinSet::new();
        for BatchRequest { mut request, slot } in batch {
            let inner = Arc::clone(&inner);
            let client = Arc::clone(&client);
            in_flight.spawn(async move {
                inner.shaper.pad_message(&mut request);
                inner.shaper.watermark(&mut request);

                let result = inner
                    .exchange_https(&client, &request, inner.batch_headers)
                    .await;
                let _ = slot.send(result);
            });
        }
        while in_flight.join_next().await.is_some() {}
    }

    debug!("batch worker stopped");
}

/// One client failure has to reach every record in the batch, and `Error`
/// is not `Clone`: rebuild the kinds callers match on, stringify the rest.
/// `Closed` in particular must survive, for records that were already
/// queued when the upstream closed.
fn replicate_client_error(err: &Error) -> Error {
    match err.kind() {
        ErrorKind::Closed => ErrorKind::Closed.into(),
        ErrorKind::Timeout { elapsed } => ErrorKind::Timeout { elapsed: *elapsed }.into(),
        _ => ErrorKind::Msg(format!("failed to init http client: {err}")).into(),
    }
}
