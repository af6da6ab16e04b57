use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use thinkflow_core::error::{Result, ThinkflowError};

use super::Broker;
use crate::message::Message;

struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

/// In-process broker backed by tokio channels.
///
/// Queues are created on first use. Consumers of one queue take turns on
/// its receiver, so each message is delivered once.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|e| ThinkflowError::Broker(e.to_string()))?;
        Ok(queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new()))
            .clone())
    }

    /// Whether a queue currently exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues
            .lock()
            .map(|q| q.contains_key(name))
            .unwrap_or(false)
    }
}

impl Broker for MemoryBroker {
    fn declare_reply_queue(&self) -> BoxFuture<'_, Result<String>> {
        let name = format!("thinkflow.reply.{}", Uuid::new_v4());
        let declared = self.queue(&name).map(|_| name);
        Box::pin(async move { declared })
    }

    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.queues
                .lock()
                .map_err(|e| ThinkflowError::Broker(e.to_string()))?
                .remove(queue);
            Ok(())
        })
    }

    fn publish<'a>(&'a self, queue: &'a str, message: Message) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.queue(queue)?
                .tx
                .send(message)
                .map_err(|_| ThinkflowError::Broker(format!("queue '{}' is closed", queue)))
        })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Option<Message>>> {
        Box::pin(async move {
            let queue = self.queue(queue)?;
            let mut rx = queue.rx.lock().await;
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(message) => Ok(message),
                Err(_) => Ok(None),
            }
        })
    }
}
