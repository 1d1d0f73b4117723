//! Scripted RCON server for tests.

use super::codec::{Packet, RconCodec, AUTH_FAILED_ID, TYPE_AUTH_RESPONSE, TYPE_RESPONSE};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    /// Answer every command with `ok: <command>`
    Echo,
    /// Accept the login, never answer a command
    Silent,
    /// Hold `n` commands, then answer them last-first
    Reversed(usize),
}

pub(crate) struct FakeServer {
    pub address: String,
    commands: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn(password: &str, reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let commands: Arc<Mutex<Vec<String>>> = Arc::default();

        let password = password.to_string();
        let recorded = Arc::clone(&commands);
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, password.clone(), reply, Arc::clone(&recorded)));
            }
        });

        Self {
            address,
            commands,
            handle,
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(socket: TcpStream, password: String, reply: Reply, commands: Arc<Mutex<Vec<String>>>) {
    let mut framed = Framed::new(socket, RconCodec);

    let Some(Ok(login)) = framed.next().await else {
        return;
    };
    if login.body != password {
        let _ = framed
            .send(Packet::new(AUTH_FAILED_ID, TYPE_AUTH_RESPONSE, ""))
            .await;
        return;
    }
    let _ = framed.send(Packet::new(login.id, TYPE_AUTH_RESPONSE, "")).await;

    let mut held = Vec::new();
    while let Some(Ok(packet)) = framed.next().await {
        commands.lock().unwrap().push(packet.body.clone());
        match reply {
            Reply::Echo => {
                let body = format!("ok: {}", packet.body);
                let _ = framed.send(Packet::new(packet.id, TYPE_RESPONSE, body)).await;
            }
            Reply::Silent => {}
            Reply::Reversed(n) => {
                held.push(packet);
                if held.len() == n {
                    for p in held.drain(..).rev() {
                        let body = format!("ok: {}", p.body);
                        let _ = framed.send(Packet::new(p.id, TYPE_RESPONSE, body)).await;
                    }
                }
            }
        }
    }
}
