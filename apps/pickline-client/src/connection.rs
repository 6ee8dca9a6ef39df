use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use pickline_core::{ClientMessage, MutationError, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::driver::{Action, Notice, SessionDriver, Step};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT: Duration = Duration::from_secs(30);

enum Command {
    Submit {
        action: Action,
        reply: oneshot::Sender<Result<Uuid, MutationError>>,
    },
    Shutdown,
}

enum Exit {
    Shutdown,
    Superseded,
    Disconnected,
}

/// Handle to a background connection that keeps one session joined,
/// reconnecting with backoff until shut down or superseded.
pub struct PickClient {
    commands: mpsc::UnboundedSender<Command>,
    notices: mpsc::UnboundedReceiver<Notice>,
    task: JoinHandle<Result<()>>,
}

impl PickClient {
    pub fn spawn(server_url: impl Into<String>, driver: SessionDriver) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(server_url.into(), driver, command_rx, notice_tx));
        Self {
            commands,
            notices,
            task,
        }
    }

    /// Applies `action` locally and sends it, or queues it while
    /// reconnecting. Returns the request id to correlate notices with.
    pub async fn submit(&self, action: Action) -> Result<Uuid> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Submit { action, reply })
            .map_err(|_| anyhow::anyhow!("client connection task has stopped"))?;
        let request_id = response
            .await
            .context("client connection task dropped the request")??;
        Ok(request_id)
    }

    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.context("client connection task panicked")?
    }
}

async fn run(
    url: String,
    mut driver: SessionDriver,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<Notice>,
) -> Result<()> {
    let mut backoff = Backoff::default();
    loop {
        match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => {
                info!(%url, "connected to session server");
                backoff.reset();
                match drive(socket, &mut driver, &mut commands, &notices).await {
                    Ok(Exit::Shutdown) => return Ok(()),
                    Ok(Exit::Superseded) => {
                        info!("connection superseded by another device; not reconnecting");
                        return Ok(());
                    }
                    Ok(Exit::Disconnected) => warn!("connection closed by server"),
                    Err(err) => warn!(error = %err, "connection failed"),
                }
            }
            Ok(Err(err)) => warn!(%url, error = %err, "failed to connect"),
            Err(_) => warn!(%url, "connect timed out"),
        }

        driver.on_disconnected();
        let delay = backoff.next_delay();
        let _ = notices.send(Notice::Reconnecting {
            attempt: backoff.attempt(),
        });
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");

        // Local actions keep flowing while offline.
        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                command = commands.recv() => match command {
                    Some(Command::Submit { action, reply }) => {
                        let _ = reply.send(driver.submit(action).map(|(id, _)| id));
                    }
                    Some(Command::Shutdown) | None => return Ok(()),
                },
            }
        }
    }
}

async fn drive(
    mut socket: Socket,
    driver: &mut SessionDriver,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Result<Exit> {
    send(&mut socket, &driver.join_message()).await?;
    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = socket.next() => {
                let Some(frame) = frame else {
                    return Ok(Exit::Disconnected);
                };
                let text = match frame? {
                    Message::Text(text) => text,
                    Message::Close(_) => return Ok(Exit::Disconnected),
                    _ => continue,
                };
                let message: ServerMessage = match serde_json::from_str(text.as_str()) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(error = %err, "ignoring undecodable frame");
                        continue;
                    }
                };
                let step = driver.on_server(message);
                flush(&mut socket, step, notices).await?;
                if driver.is_superseded() {
                    return Ok(Exit::Superseded);
                }
            }
            command = commands.recv() => match command {
                Some(Command::Submit { action, reply }) => match driver.submit(action) {
                    Ok((request_id, message)) => {
                        let _ = reply.send(Ok(request_id));
                        send(&mut socket, &message).await?;
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                },
                Some(Command::Shutdown) | None => {
                    let _ = socket.close(None).await;
                    return Ok(Exit::Shutdown);
                }
            },
            _ = heartbeat.tick() => send(&mut socket, &ClientMessage::Ping).await?,
        }
    }
}

async fn flush(
    socket: &mut Socket,
    step: Step,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Result<()> {
    for message in &step.outgoing {
        send(socket, message).await?;
    }
    for notice in step.notices {
        let _ = notices.send(notice);
    }
    Ok(())
}

async fn send(socket: &mut Socket, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    socket.send(Message::text(json)).await?;
    Ok(())
}
