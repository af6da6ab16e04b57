use std::sync::Mutex;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use thinkflow_core::error::{Result, ThinkflowError};

use super::Broker;
use crate::message::Message;

/// Key prefix of per-client reply queues.
pub const REPLY_PREFIX: &str = "thinkflow:reply:";

/// Longest single `BRPOP` block. Kept below the client's response timeout;
/// longer waits issue several blocks back to back.
const MAX_BLOCK: Duration = Duration::from_millis(250);

fn broker_err(e: ::redis::RedisError) -> ThinkflowError {
    ThinkflowError::Broker(e.to_string())
}

/// Broker on Redis lists.
///
/// A queue is a list: publishers `LPUSH` the JSON-encoded envelope and
/// consumers `BRPOP`, which hands each message to one consumer. Publishes
/// share one multiplexed connection; a blocking pop would stall it, so each
/// concurrent `receive` borrows a dedicated connection from a small pool.
/// Reply queues get a TTL, refreshed on every reply, so queues of clients
/// that died without cleaning up expire.
pub struct RedisBroker {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    reply_ttl: Duration,
}

impl RedisBroker {
    pub async fn connect(url: &str, reply_ttl: Duration) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(broker_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_err)?;
        info!(url, "Connected to Redis broker");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            reply_ttl,
        })
    }

    /// Take an idle blocking connection, or open a new one.
    async fn checkout(&self) -> Result<MultiplexedConnection> {
        let idle = self
            .blocking
            .lock()
            .map_err(|e| ThinkflowError::Broker(e.to_string()))?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening blocking Redis connection");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(broker_err)
            }
        }
    }

    /// Return a connection after a completed pop. Connections whose pop was
    /// interrupted are dropped instead, since a reply may still be in flight.
    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.blocking.lock() {
            idle.push(conn);
        }
    }
}

/// Encode an envelope for storage in a list.
fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a list entry. Entries that are not envelopes are dropped with a
/// warning since there is nobody to reply to.
fn decode(queue: &str, raw: &str) -> Option<Message> {
    match serde_json::from_str(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(queue, error = %e, "Dropping undecodable broker entry");
            None
        }
    }
}

impl Broker for RedisBroker {
    fn declare_reply_queue(&self) -> BoxFuture<'_, Result<String>> {
        // Redis lists exist once they hold an element; nothing to create.
        let name = format!("{}{}", REPLY_PREFIX, Uuid::new_v4());
        Box::pin(async move { Ok(name) })
    }

    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = ::redis::cmd("DEL")
                .arg(queue)
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;
            Ok(())
        })
    }

    fn publish<'a>(&'a self, queue: &'a str, message: Message) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = encode(&message)?;
            let mut conn = self.conn.clone();
            let _: () = ::redis::cmd("LPUSH")
                .arg(queue)
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(broker_err)?;

            if queue.starts_with(REPLY_PREFIX) {
                let _: () = ::redis::cmd("EXPIRE")
                    .arg(queue)
                    .arg(self.reply_ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await
                    .map_err(broker_err)?;
            }
            debug!(queue, correlation_id = %message.correlation_id, "Published");
            Ok(())
        })
    }

    fn receive<'a>(
        &'a self,
        queue: &'a str,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Option<Message>>> {
        Box::pin(async move {
            let deadline = Instant::now() + wait;
            let mut conn = self.checkout().await?;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    self.checkin(conn);
                    return Ok(None);
                }
                // BRPOP takes fractional seconds; zero would block forever.
                let block = MAX_BLOCK.min(deadline - now).max(Duration::from_millis(10));
                let popped: Option<(String, String)> = ::redis::cmd("BRPOP")
                    .arg(queue)
                    .arg(block.as_secs_f64())
                    .query_async(&mut conn)
                    .await
                    .map_err(broker_err)?;
                if let Some((_, raw)) = popped {
                    if let Some(message) = decode(queue, &raw) {
                        self.checkin(conn);
                        return Ok(Some(message));
                    }
                }
            }
        })
    }
}
