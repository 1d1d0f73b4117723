//! Control-channel client (RCON).
//!
//! One TCP connection per client. Commands may be pipelined: each request
//! carries its own id and responses are routed back through a pending map,
//! so replies are correlated even if the server reorders them. The client
//! never reconnects or retries; callers decide what a failure means.

pub mod codec;
pub mod commands;

#[cfg(test)]
pub(crate) mod fake;

use crate::utils::errors::{ManagerError, Result};
use codec::{
    Packet, RconCodec, AUTH_FAILED_ID, MAX_COMMAND_LEN, TYPE_AUTH, TYPE_AUTH_RESPONSE,
    TYPE_COMMAND, TYPE_RESPONSE,
};
use commands::GameCommand;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const LOGIN_REQUEST_ID: i32 = 1;

type PendingMap = Arc<std::sync::Mutex<HashMap<i32, oneshot::Sender<String>>>>;

pub struct RconClient {
    sink: Mutex<SplitSink<Framed<TcpStream, RconCodec>, Packet>>,
    pending: PendingMap,
    next_id: AtomicI32,
    reader: JoinHandle<()>,
    timeout: Duration,
    closed: AtomicBool,
}

impl RconClient {
    /// Connect to `address` and log in with `password`.
    ///
    /// `timeout` bounds the TCP connect, the login exchange and every later
    /// command round-trip.
    pub async fn connect(address: &str, password: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ManagerError::Connect(format!("timed out connecting to {}", address)))?
            .map_err(|e| ManagerError::Connect(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, RconCodec);
        framed
            .send(Packet::new(LOGIN_REQUEST_ID, TYPE_AUTH, password))
            .await
            .map_err(|e| ManagerError::Connect(e.to_string()))?;

        tokio::time::timeout(timeout, await_login(&mut framed))
            .await
            .map_err(|_| ManagerError::Timeout(timeout))??;

        info!("Control channel connected to {}", address);

        let (sink, stream) = framed.split();
        let pending: PendingMap = Arc::default();
        let reader = tokio::spawn(route_responses(stream, Arc::clone(&pending)));

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicI32::new(LOGIN_REQUEST_ID + 1),
            reader,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Send one command and wait for the response carrying the same id.
    ///
    /// A timeout means the command may or may not have taken effect. A
    /// failed or timed-out send leaves the stream mid-frame, so it closes
    /// the client and later commands fail with `Connect`.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ManagerError::Connect("connection closed".to_string()));
        }
        if command.len() > MAX_COMMAND_LEN {
            return Err(ManagerError::Protocol(format!(
                "command of {} bytes exceeds the {} byte limit",
                command.len(),
                MAX_COMMAND_LEN
            )));
        }

        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id, tx);

        let sent = {
            let mut sink = self.sink.lock().await;
            tokio::time::timeout(self.timeout, sink.send(Packet::new(id, TYPE_COMMAND, command)))
                .await
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Control channel send failed, closing connection: {}", e);
                self.close().await;
                return Err(ManagerError::Connect(e.to_string()));
            }
            Err(_) => {
                warn!("Control channel send timed out, closing connection");
                self.close().await;
                return Err(ManagerError::Timeout(self.timeout));
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(body)) => {
                debug!(id, command, "Control command answered");
                Ok(body)
            }
            Ok(Err(_)) => Err(ManagerError::Connect(
                "connection closed before the response arrived".to_string(),
            )),
            Err(_) => {
                self.forget(id);
                Err(ManagerError::Timeout(self.timeout))
            }
        }
    }

    pub async fn run(&self, command: &GameCommand) -> Result<String> {
        self.send_command(&command.render()).await
    }

    /// Release the connection. Outstanding commands fail with `Connect`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        self.pending_map().clear();
    }

    fn allocate_id(&self) -> i32 {
        // Ids stay positive; -1 is reserved for rejected logins.
        (self.next_id.fetch_add(1, Ordering::Relaxed) & i32::MAX).max(LOGIN_REQUEST_ID + 1)
    }

    fn forget(&self, id: i32) {
        self.pending_map().remove(&id);
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<i32, oneshot::Sender<String>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending_map().len()
    }
}

impl Drop for RconClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn await_login(framed: &mut Framed<TcpStream, RconCodec>) -> Result<()> {
    loop {
        match framed.next().await {
            Some(Ok(packet)) if packet.kind == TYPE_AUTH_RESPONSE => {
                return match packet.id {
                    AUTH_FAILED_ID => Err(ManagerError::Auth),
                    LOGIN_REQUEST_ID => Ok(()),
                    other => Err(ManagerError::Protocol(format!(
                        "login answered for unknown request id {}",
                        other
                    ))),
                };
            }
            // Some servers send an empty response value before the auth reply
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ManagerError::Protocol(e.to_string())),
            None => {
                return Err(ManagerError::Connect(
                    "connection closed during login".to_string(),
                ))
            }
        }
    }
}

async fn route_responses(mut stream: SplitStream<Framed<TcpStream, RconCodec>>, pending: PendingMap) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(packet) if packet.kind == TYPE_RESPONSE => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&packet.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(packet.body);
                    }
                    None => debug!(id = packet.id, "Dropping response for unknown request id"),
                }
            }
            Ok(packet) => debug!(id = packet.id, kind = packet.kind, "Ignoring unexpected packet"),
            Err(e) => {
                warn!("Control channel read error: {}", e);
                break;
            }
        }
    }

    // Dropping the senders fails every waiter still pending.
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    debug!("Control channel reader stopped");
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeServer, Reply};
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_command_round_trip() {
        let server = FakeServer::spawn("hunter2", Reply::Echo).await;
        let client = RconClient::connect(&server.address, "hunter2", TIMEOUT).await.unwrap();

        let response = client.run(&GameCommand::SaveAll { flush: true }).await.unwrap();
        assert_eq!(response, "ok: save-all flush");
        assert_eq!(server.commands(), vec!["save-all flush".to_string()]);

        client.close().await;
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_error() {
        let server = FakeServer::spawn("hunter2", Reply::Echo).await;
        let err = RconClient::connect(&server.address, "guess", TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Auth));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RconClient::connect(&address, "hunter2", TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Connect(_)));
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out() {
        let server = FakeServer::spawn("hunter2", Reply::Silent).await;
        let client = RconClient::connect(&server.address, "hunter2", Duration::from_millis(100))
            .await
            .unwrap();

        let err = client.send_command("save-all flush").await.unwrap_err();
        assert!(matches!(err, ManagerError::Timeout(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_commands() {
        let server = FakeServer::spawn("hunter2", Reply::Echo).await;
        let client = RconClient::connect(&server.address, "hunter2", TIMEOUT).await.unwrap();
        client.close().await;

        let err = client.run(&GameCommand::SaveOn).await.unwrap_err();
        assert!(matches!(err, ManagerError::Connect(_)));
        assert_eq!(client.pending_count(), 0);
        assert!(server.commands().is_empty());
    }

    #[tokio::test]
    async fn test_reordered_responses_are_correlated() {
        let server = FakeServer::spawn("hunter2", Reply::Reversed(3)).await;
        let client = RconClient::connect(&server.address, "hunter2", TIMEOUT).await.unwrap();

        let (a, b, c) = tokio::join!(
            client.send_command("first"),
            client.send_command("second"),
            client.send_command("third"),
        );

        assert_eq!(a.unwrap(), "ok: first");
        assert_eq!(b.unwrap(), "ok: second");
        assert_eq!(c.unwrap(), "ok: third");
    }

    #[tokio::test]
    async fn test_oversized_command_rejected_locally() {
        let server = FakeServer::spawn("hunter2", Reply::Echo).await;
        let client = RconClient::connect(&server.address, "hunter2", TIMEOUT).await.unwrap();

        let err = client.send_command(&"x".repeat(MAX_COMMAND_LEN + 1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Protocol(_)));
        assert!(server.commands().is_empty());
    }
}
