use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::MessageBus;

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bus over PostgreSQL `NOTIFY`/`LISTEN`, shared by every server process using the database.
#[derive(Clone)]
pub struct PgNotifyBus {
    pool: PgPool,
    capacity: usize,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool, capacity: usize) -> Self {
        Self { pool, capacity: capacity.max(1) }
    }
}

#[async_trait]
impl MessageBus for PgNotifyBus {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to notify channel {topic}"))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<mpsc::Receiver<String>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("failed to open PostgreSQL listener connection")?;
        listener.listen(topic).await.with_context(|| format!("failed to LISTEN on {topic}"))?;
        info!(topic, "listening for stream event notifications");

        let (forward, receiver) = mpsc::channel(self.capacity);
        let topic = topic.to_owned();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward.closed() => break,
                    notification = listener.recv() => match notification {
                        Ok(notification) => {
                            if forward.send(notification.payload().to_owned()).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            // The listener reconnects on the next recv; notifications sent
                            // while disconnected are lost and recovered by client catch-up.
                            warn!(topic = %topic, error = ?error, "PostgreSQL listener error");
                            tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }

    fn notifies_on_commit(&self) -> bool {
        true
    }
}
