use std::sync::Arc;

use log::{debug, error, info, warn};
use sensor_common::{Reading, ReadingError, UnrecognizedTopic};
use sensor_database::{InsertStatement, ReadingStore, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::listener::InboundMessage;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{}", .0)]
    UnknownTopic(#[from] UnrecognizedTopic),
    #[error("InvalidPayload({})", .0)]
    InvalidPayload(#[from] ReadingError),
    #[error("StoreError({})", .0)]
    Store(#[from] StoreError),
}

/// Result of a successful write.
#[derive(Debug, PartialEq)]
pub struct Persisted {
    pub reading: Reading,
    pub rows_affected: usize,
}

/// Turns broker messages into inserts. Holds everything a message needs, so one
/// instance is built at startup and shared by all writers.
pub struct Dispatcher<S> {
    store: S,
}

impl<S: ReadingStore> Dispatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Route, parse and persist a single message.
    pub async fn dispatch(&self, message: &InboundMessage) -> Result<Persisted, DispatchError> {
        let route = sensor_common::resolve(&message.topic)?;
        let value = String::from_utf8_lossy(&message.payload);
        let reading = Reading::parse(route.topic, &value, message.received_at)?;
        debug!(
            "Reading: {}",
            serde_json::to_string(&reading).unwrap_or_else(|_| "error".to_string())
        );

        let statement = InsertStatement::for_reading(&reading);
        let rows_affected = self.store.execute(&statement).await?;

        Ok(Persisted { reading, rows_affected })
    }

    /// Dispatch a message and log how it went. Failures end here.
    pub async fn handle(&self, message: InboundMessage) -> Result<Persisted, DispatchError> {
        info!(
            "Received message on topic {}: {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );

        let result = self.dispatch(&message).await;
        match &result {
            Ok(persisted) => info!(
                "Inserted data into {}: {}",
                persisted.reading.topic.route().table,
                persisted.rows_affected > 0
            ),
            Err(DispatchError::UnknownTopic(topic)) => warn!("Unknown topic: {}", topic.0),
            Err(DispatchError::InvalidPayload(e)) => {
                warn!("Dropping message on {}: {}", message.topic, e)
            }
            Err(DispatchError::Store(e)) => {
                error!("Error saving data from {}: {}", message.topic, e)
            }
        }
        result
    }

    /// Drain `receiver`, running at most `workers` writes at once. Returns after the
    /// channel closes and every started write has finished.
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<InboundMessage>, workers: usize) {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        while let Some(message) = receiver.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let _ = dispatcher.handle(message).await;
                drop(permit);
            });

            // Reap finished writes so the set stays small.
            while tasks.try_join_next().is_some() {}
        }

        debug!("Message channel closed, waiting for {} writes", tasks.len());
        while tasks.join_next().await.is_some() {}
    }
}
