//! PostgreSQL implementation of the NotificationChannel port.
//!
//! Sending rides on `pg_notify` over the shared pool. Receiving runs on a dedicated
//! dispatch task that owns a `PgListener` connection and multiplexes two
//! inputs: dynamic listen/unlisten commands from the bus, and incoming
//! notifications, which it fans out to the local bus. The notification
//! payload is the decimal string form of an outbox row id, comfortably
//! inside the transport's short-message limit.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{BusEvent, LocalEventBus};
use crate::error::EngineError;
use crate::ports::{Notification, NotificationChannel};

enum Command {
    Listen(String, oneshot::Sender<Result<(), EngineError>>),
    Unlisten(String, oneshot::Sender<Result<(), EngineError>>),
    Shutdown,
}

/// LISTEN/NOTIFY adapter over a PostgreSQL pool.
pub struct PostgresNotifyChannel {
    pool: PgPool,
    commands: mpsc::UnboundedSender<Command>,
    pending_receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresNotifyChannel {
    /// Creates the adapter. The dispatch task is not running until
    /// [`start`](Self::start) is called with the bus to fan out into.
    pub fn new(pool: PgPool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            pool,
            commands: sender,
            pending_receiver: Mutex::new(Some(receiver)),
            task: Mutex::new(None),
        }
    }

    /// Connects the listening side and spawns the dispatch task.
    ///
    /// The task holds the bus weakly: dropping the engine (and with it the
    /// bus) ends the task instead of leaking the connection.
    pub async fn start(&self, bus: Weak<LocalEventBus>) -> Result<(), EngineError> {
        let receiver = self
            .pending_receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::transport("dispatch task already started"))?;

        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(EngineError::transport)?;

        let handle = tokio::spawn(dispatch_loop(listener, receiver, bus));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn send_command(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), EngineError>>) -> Command,
    ) -> Result<(), EngineError> {
        let (reply, confirm) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| EngineError::transport("notification dispatch task is gone"))?;
        confirm
            .await
            .map_err(|_| EngineError::transport("notification dispatch task is gone"))?
    }
}

#[async_trait::async_trait]
impl NotificationChannel for PostgresNotifyChannel {
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), EngineError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::notify_delivery(channel, e))?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<(), EngineError> {
        let channel = channel.to_string();
        self.send_command(move |reply| Command::Listen(channel, reply))
            .await
    }

    async fn unlisten(&self, channel: &str) -> Result<(), EngineError> {
        let channel = channel.to_string();
        self.send_command(move |reply| Command::Unlisten(channel, reply))
            .await
    }

    async fn close(&self) -> Result<(), EngineError> {
        // Shutdown may race task exit; a closed command channel is fine.
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn dispatch_loop(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<Command>,
    bus: Weak<LocalEventBus>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen(channel, reply)) => {
                    let result = listener
                        .listen(&channel)
                        .await
                        .map_err(EngineError::transport);
                    let _ = reply.send(result);
                }
                Some(Command::Unlisten(channel, reply)) => {
                    let result = listener
                        .unlisten(&channel)
                        .await
                        .map_err(EngineError::transport);
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown) | None => {
                    debug!("notification dispatch task stopping");
                    return;
                }
            },
            incoming = listener.recv() => match incoming {
                Ok(notification) => {
                    let Some(bus) = bus.upgrade() else { return };
                    bus.emit(
                        notification.channel(),
                        BusEvent::Notify(Notification {
                            channel: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                        }),
                    )
                    .await;
                }
                Err(error) => {
                    warn!(%error, "notification connection failed");
                    let Some(bus) = bus.upgrade() else { return };
                    bus.broadcast_error(EngineError::transport(error)).await;
                    return;
                }
            },
        }
    }
}
