//! Tokio wiring for the server core.
//!
//! One task owns the [`Server`] and drives it from a `select!` loop over
//! the UDP socket, the two deadline timers, and a command channel; every
//! callback into the core is therefore serialized, as the protocol
//! requires. External parties (the HTTP API, a registered update handler,
//! the binary's shutdown path) talk to the loop through a cloneable
//! [`ServerHandle`].

use crate::config::{AddressMode, SharedConfig};
use crate::error::Error;
use crate::registry::{HostSnapshot, RegistryEvent};
use crate::server::{Action, DynUpdateHandler, ResponseCounters, Server, State, UpdateId};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 256;
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Commands accepted by the run loop.
pub enum Command {
    UpdateResult {
        id: UpdateId,
        result: Result<(), Error>,
    },
    SetEnabled(bool),
    SetHandler(DynUpdateHandler),
    Status(oneshot::Sender<Status>),
    Hosts(oneshot::Sender<Vec<HostSnapshot>>),
}

/// A point-in-time view of the server, served by the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: State,
    pub port: u16,
    pub domain: String,
    pub address_mode: AddressMode,
    pub counters: ResponseCounters,
}

/// Handle to interact with a running server task.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServerHandle {
    /// Report the verdict of an update handler for transaction `id`.
    pub async fn report_update_result(
        &self,
        id: UpdateId,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        self.commands
            .send(Command::UpdateResult { id, result })
            .await
            .map_err(|_| Error::InvalidState)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.commands
            .send(Command::SetEnabled(enabled))
            .await
            .map_err(|_| Error::InvalidState)
    }

    /// Register the external update handler consulted before every commit.
    pub async fn set_handler(&self, handler: DynUpdateHandler) -> Result<(), Error> {
        self.commands
            .send(Command::SetHandler(handler))
            .await
            .map_err(|_| Error::InvalidState)
    }

    pub async fn status(&self) -> Result<Status, Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(reply))
            .await
            .map_err(|_| Error::InvalidState)?;
        rx.await.map_err(|_| Error::InvalidState)
    }

    pub async fn hosts(&self) -> Result<Vec<HostSnapshot>, Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Hosts(reply))
            .await
            .map_err(|_| Error::InvalidState)?;
        rx.await.map_err(|_| Error::InvalidState)
    }

    /// Subscribe to registry change events. Slow consumers may observe
    /// lagged gaps, never stale events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

/// Build a server task for `config`. The returned future is the run loop;
/// spawn it, then use the handle.
pub fn new(
    config: SharedConfig,
    cancel: CancellationToken,
) -> (ServerHandle, impl Future<Output = Result<(), Error>>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (events_tx, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
    let handle = ServerHandle {
        commands: commands_tx,
        events: events_tx.clone(),
    };
    let server = Server::new(&config);
    let future = run(server, config, commands_rx, events_tx, cancel);
    (handle, future)
}

async fn run(
    mut server: Server,
    config: SharedConfig,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<RegistryEvent>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    server.set_enabled(true);

    let mut socket: Option<UdpSocket> = None;
    let mut bound_port: u16 = 0;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        carry_out_actions(&mut server, &socket, &events).await;

        // Follow the core's port selection with the actual socket.
        if server.state() == State::Running {
            let port = server.port();
            if socket.is_none() || bound_port != port {
                match UdpSocket::bind((config.listen_addr, port)).await {
                    Ok(bound) => {
                        info!(port, "SRP server listening on UDP");
                        socket = Some(bound);
                        bound_port = port;
                    }
                    Err(err) => {
                        error!(%err, port, "failed to bind SRP socket");
                        socket = None;
                        bound_port = 0;
                        server.stop_running();
                        continue;
                    }
                }
            }
        } else if socket.take().is_some() {
            bound_port = 0;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                server.set_enabled(false);
                carry_out_actions(&mut server, &socket, &events).await;
                info!("SRP server shut down");
                return Ok(());
            }
            command = commands.recv() => {
                match command {
                    None => {
                        server.set_enabled(false);
                        carry_out_actions(&mut server, &socket, &events).await;
                        return Ok(());
                    }
                    Some(Command::UpdateResult { id, result }) => {
                        server.handle_service_update_result(id, result, Instant::now());
                    }
                    Some(Command::SetEnabled(enabled)) => server.set_enabled(enabled),
                    Some(Command::SetHandler(handler)) => server.set_handler(handler),
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(Status {
                            state: server.state(),
                            port: server.port(),
                            domain: server.domain().to_string(),
                            address_mode: server.address_mode(),
                            counters: *server.counters(),
                        });
                    }
                    Some(Command::Hosts(reply)) => {
                        let _ = reply.send(server.host_snapshots());
                    }
                }
            }
            received = recv_from(&socket, &mut buf) => {
                match received {
                    Ok((len, src)) => server.handle_message(&buf[..len], Some(src), Instant::now()),
                    Err(err) => {
                        warn!(%err, "UDP receive failed");
                        server.stop_running();
                    }
                }
            }
            _ = sleep_until_opt(server.next_lease_deadline()) => {
                server.handle_lease_timer(Instant::now());
            }
            _ = sleep_until_opt(server.next_update_deadline()) => {
                server.handle_outstanding_updates_timer(Instant::now());
            }
        }
    }
}

async fn carry_out_actions(
    server: &mut Server,
    socket: &Option<UdpSocket>,
    events: &broadcast::Sender<RegistryEvent>,
) {
    for action in server.take_actions() {
        match action {
            Action::Send { dst, payload } => {
                if let Some(socket) = socket {
                    if let Err(err) = socket.send_to(&payload, dst).await {
                        warn!(%err, %dst, "failed to send response");
                    }
                }
            }
            Action::CallHandler { id, host } => {
                if let Some(handler) = server.handler() {
                    tokio::spawn(async move { handler.on_update(id, host).await });
                }
            }
            Action::Publish {
                mode,
                port,
                sequence_number,
            } => {
                // The network-data publisher is an external collaborator;
                // surface the advertisement for it.
                info!(?mode, port, sequence_number, "advertising SRP service");
            }
            Action::Unpublish => info!("withdrawing SRP service advertisement"),
            Action::Event(event) => {
                let _ = events.send(event);
            }
        }
    }
}

async fn recv_from(
    socket: &Option<UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending().await,
    }
}
