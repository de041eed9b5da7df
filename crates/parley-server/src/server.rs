//! The relay event loop.
//!
//! One task owns the listener, every accepted connection, and the session
//! registry. Each iteration waits on whichever comes first: a new
//! connection, a readable socket, an operator command, the stop flag, or
//! the housekeeping tick. Envelopes from one connection are handled in
//! arrival order; nothing else in the process mutates relay state.

use crate::auth::LoginThrottle;
use crate::config::ServerConfig;
use crate::connection::{ConnId, Connection};
use crate::directory::UserDirectory;
use crate::relay::Relay;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parley_core::{json_decode, Envelope, ParleyError, ParleyResult};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Operator requests delivered to the loop.
#[derive(Debug)]
pub enum ServerCommand {
    /// Push a 205 to every bound session.
    NotifyContactsChanged,
    /// Report the usernames currently bound.
    Sessions(oneshot::Sender<Vec<String>>),
}

/// Cloneable control handle for a running [`RelayServer`].
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<ServerCommand>,
    stop: Arc<watch::Sender<bool>>,
    local_addr: SocketAddr,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tell every logged-in client its contact list may be stale.
    pub async fn notify_contacts_changed(&self) -> ParleyResult<()> {
        self.commands
            .send(ServerCommand::NotifyContactsChanged)
            .await
            .map_err(|_| stopped())
    }

    /// Usernames with a live session, sorted.
    pub async fn sessions(&self) -> ParleyResult<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Sessions(tx))
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Ask the loop to stop after its current iteration.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

fn stopped() -> ParleyError {
    ParleyError::Other("relay is not running".into())
}

/// What woke the loop. Owns its data so relay state is free to mutate.
enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Readable(ConnId, io::Result<()>),
    Command(Option<ServerCommand>),
    StopChanged(bool),
    Tick,
}

pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    relay: Relay,
    commands: mpsc::Receiver<ServerCommand>,
    stop: watch::Receiver<bool>,
    next_id: ConnId,
}

impl RelayServer {
    /// Bind the listening socket. The returned handle controls the server
    /// once [`run`](Self::run) is called.
    pub async fn bind(
        config: ServerConfig,
        directory: Arc<dyn UserDirectory>,
    ) -> ParleyResult<(Self, RelayHandle)> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);

        let throttle = LoginThrottle::new(config.login_max_attempts, config.login_window);
        let relay = Relay::new(directory, throttle, config.io_timeout);

        let server = Self {
            config,
            listener,
            relay,
            commands: command_rx,
            stop: stop_rx,
            next_id: 1,
        };
        let handle = RelayHandle {
            commands: command_tx,
            stop: Arc::new(stop_tx),
            local_addr,
        };
        Ok((server, handle))
    }

    /// Serve until the stop flag is raised, then close every connection.
    pub async fn run(mut self) -> ParleyResult<()> {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;
        let mut stop_open = true;

        info!(
            addr = %self.listener.local_addr()?,
            max_connections = self.config.max_connections,
            "parley relay ready"
        );

        loop {
            if *self.stop.borrow() {
                break;
            }

            let event = {
                let mut readable: FuturesUnordered<_> = self
                    .relay
                    .connections
                    .values()
                    .map(|conn| async move { (conn.id(), conn.readable().await) })
                    .collect();

                tokio::select! {
                    accepted = self.listener.accept() => Event::Accepted(accepted),
                    Some((id, ready)) = readable.next(), if !readable.is_empty() => {
                        Event::Readable(id, ready)
                    }
                    cmd = self.commands.recv(), if commands_open => Event::Command(cmd),
                    changed = self.stop.changed(), if stop_open => {
                        Event::StopChanged(changed.is_ok())
                    }
                    _ = tick.tick() => Event::Tick,
                }
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => self.accept(stream, peer),
                Event::Accepted(Err(e)) => debug!(error = %e, "accept failed"),
                Event::Readable(id, Ok(())) => self.service(id).await,
                Event::Readable(id, Err(e)) => {
                    warn!(conn = id, error = %e, "readiness error");
                    self.relay.close_connection(id, "readiness error");
                }
                Event::Command(Some(cmd)) => self.command(cmd),
                Event::Command(None) => commands_open = false,
                Event::StopChanged(open) => stop_open = open,
                Event::Tick => {
                    self.relay.expire_challenges(Instant::now());
                    self.relay.throttle.gc();
                }
            }
        }

        info!(connections = self.relay.connection_count(), "parley relay stopping");
        self.relay.close_all();
        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.relay.connection_count() >= self.config.max_connections {
            warn!(%peer, max = self.config.max_connections, "connection limit reached, refusing");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        let id = self.next_id;
        self.next_id += 1;
        let conn = Connection::new(
            id,
            stream,
            peer,
            self.config.max_frame_len,
            self.config.io_timeout,
        );
        self.relay.connections.insert(id, conn);
        info!(conn = id, %peer, "client connected");
    }

    /// Drain a readable connection and dispatch every complete envelope.
    async fn service(&mut self, id: ConnId) {
        let Some(conn) = self.relay.connections.get_mut(&id) else {
            return;
        };
        let span = conn.span().clone();
        let outcome = conn.read_available();
        let relay = &mut self.relay;

        async move {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "read failed");
                    relay.close_connection(id, "read failed");
                    return;
                }
            };

            for frame in outcome.frames {
                if !relay.is_live(id) {
                    return;
                }
                match json_decode::<Envelope>(&frame) {
                    Ok(envelope) => relay.dispatch(id, envelope).await,
                    Err(e) => {
                        warn!(error = %e, "undecodable envelope");
                        relay.close_connection(id, "malformed envelope");
                        return;
                    }
                }
            }

            if outcome.closed {
                relay.close_connection(id, "peer closed");
            }
        }
        .instrument(span)
        .await
    }

    fn command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::NotifyContactsChanged => {
                self.relay.broadcast_contacts_changed();
            }
            ServerCommand::Sessions(reply) => {
                let _ = reply.send(self.relay.registry().usernames());
            }
        }
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("connections", &self.relay.connection_count())
            .finish_non_exhaustive()
    }
}
