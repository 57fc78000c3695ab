//! Connection tasks.
//!
//! Each connection runs in its own tokio task and reports back to the
//! download loop over a channel. A task never retries; it reports `Failed`
//! and the loop decides.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::{Connection, ConnectionError, ConnectionResult, Endpoint};
use crate::pool::{SharedPool, WorkerId};
use crate::storage::SharedFile;

/// Report from a connection task.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// Response headers accepted, body about to stream.
    Connected { worker: WorkerId },
    /// `bytes` more were written and advanced.
    Progress { worker: WorkerId, bytes: u64 },
    /// The worker's range is fully written.
    Finished { worker: WorkerId },
    Failed {
        worker: WorkerId,
        error: ConnectionError,
    },
}

/// Everything a connection task shares with the download.
#[derive(Debug, Clone)]
pub(crate) struct TaskContext {
    pub endpoint: Endpoint,
    pub pool: SharedPool,
    pub file: SharedFile,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub cancel: CancellationToken,
}

/// How a task obtains its connection.
#[derive(Debug)]
pub(crate) enum Launch {
    /// Request the worker's range, after an optional delay.
    Fresh { worker: WorkerId, delay: Duration },
    /// Stream a connection whose response is already in hand.
    Connected(Box<Connection>),
}

impl Launch {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Fresh { worker, .. } => *worker,
            Self::Connected(connection) => connection.worker(),
        }
    }
}

/// Body of a connection task.
pub(crate) async fn run(context: TaskContext, launch: Launch) {
    let worker = launch.worker();
    let pool = context.pool.clone();
    let cancel = context.cancel.clone();

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = pool.lock().cancel_reservation(worker);
            trace!(worker, "Connection task cancelled");
        }
        _ = drive(&context, launch) => {}
    }
}

async fn drive(context: &TaskContext, launch: Launch) {
    let mut connection = match launch {
        Launch::Fresh { worker, delay } => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Box::new(Connection::new(
                worker,
                context.endpoint.clone(),
                context.pool.clone(),
            ))
        }
        Launch::Connected(connection) => connection,
    };
    let worker = connection.worker();

    let event = match transfer(&mut connection, context).await {
        Ok(()) => ConnectionEvent::Finished { worker },
        Err(error) => ConnectionEvent::Failed { worker, error },
    };
    connection.dispose();
    let _ = context.events.send(event);
}

async fn transfer(connection: &mut Connection, context: &TaskContext) -> ConnectionResult<()> {
    let worker = connection.worker();
    if connection.info().is_none() {
        connection.request().await?;
    }
    let _ = context.events.send(ConnectionEvent::Connected { worker });

    connection.attach(context.file.clone());
    let events = context.events.clone();
    connection
        .stream(move |bytes| {
            let _ = events.send(ConnectionEvent::Progress { worker, bytes });
        })
        .await
}
