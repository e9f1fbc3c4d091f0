//! Mesh Router
//!
//! Single-consumer task that owns the `MeshState`. Link events from the
//! supervisor and commands from the application are processed one at a time,
//! and the resulting actions are carried out against the supervisor, the
//! identity store and the application channel.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::state::{Action, MeshSnapshot, MeshState, ReceivedMessage};
use crate::error::{MeshError, Result};
use crate::identity_store::IdentityStore;
use crate::link::supervisor::{ConnectionSupervisor, LinkEvent};
use crate::types::{Identity, LinkAddress};

/// Link status notifications for the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkStatus {
    Connected { address: LinkAddress },
    Lost { address: LinkAddress },
    DialFailed { address: LinkAddress, reason: String },
    ListenFailed { reason: String },
}

/// Everything the mesh reports upward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MeshEvent {
    Message(ReceivedMessage),
    Status(LinkStatus),
}

enum RouterCommand {
    Send {
        target: Identity,
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
    Shutdown,
}

/// Handle to the router task
#[derive(Clone)]
pub struct MeshRouter {
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl MeshRouter {
    pub fn spawn(
        state: MeshState,
        supervisor: ConnectionSupervisor,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        store: Arc<dyn IdentityStore>,
        app_events: mpsc::UnboundedSender<MeshEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = RouterTask {
            state,
            supervisor,
            store,
            app_events,
        };
        let handle = tokio::spawn(task.run(link_events, command_rx));

        (Self { commands }, handle)
    }

    /// Originate a CHAT. Fails on a local lookup miss or when the first-hop
    /// link cannot take the frame; success means it was queued on that link,
    /// nothing more.
    pub async fn send_message(&self, target: Identity, content: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::Send { target, content, reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::Snapshot { reply })
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(RouterCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

struct RouterTask {
    state: MeshState,
    supervisor: ConnectionSupervisor,
    store: Arc<dyn IdentityStore>,
    app_events: mpsc::UnboundedSender<MeshEvent>,
}

impl RouterTask {
    async fn run(
        mut self,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
    ) {
        info!("Mesh router started as {}", self.state.local_identity());

        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(RouterCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
            }
        }

        info!("Mesh router stopped");
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        self.refresh_local_address();

        let actions = match event {
            LinkEvent::Established(address) => {
                self.notify(LinkStatus::Connected {
                    address: address.clone(),
                });
                self.state.link_established(address)
            }
            LinkEvent::Lost(address) => {
                self.notify(LinkStatus::Lost {
                    address: address.clone(),
                });
                self.state.link_lost(&address)
            }
            LinkEvent::Received { from, payload } => {
                match self.state.handle_inbound(&from, &payload, Instant::now()) {
                    Ok(actions) => actions,
                    Err(e) => {
                        warn!("Dropping frame from {}: {}", from, e);
                        Vec::new()
                    }
                }
            }
            LinkEvent::DialFailed { address, reason } => {
                self.notify(LinkStatus::DialFailed { address, reason });
                Vec::new()
            }
            LinkEvent::ListenFailed(reason) => {
                self.notify(LinkStatus::ListenFailed { reason });
                Vec::new()
            }
        };

        if let Err(e) = self.execute(actions).await {
            debug!("Action after link event failed: {}", e);
        }
    }

    async fn on_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Send {
                target,
                content,
                reply,
            } => {
                self.refresh_local_address();

                let result = match self.state.originate(&target, &content) {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("Message to {} not sent: {}", target, e);
                }
                let _ = reply.send(result);
            }
            RouterCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            RouterCommand::Shutdown => {}
        }
    }

    /// Carry out every action in order; returns the first send failure.
    /// Sends only queue frames on their links, so a stalled peer never holds
    /// up the router.
    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut first_error = None;

        for action in actions {
            match action {
                Action::Send { to, message } => {
                    if let Err(e) = self.supervisor.send(&to, &message.encode()) {
                        warn!("{} to {} failed: {}", message.kind(), to, e);
                        first_error.get_or_insert(e);
                    }
                }
                Action::Broadcast(message) => {
                    let delivered = self.supervisor.broadcast(&message.encode());
                    debug!("Broadcast {} to {} links", message.kind(), delivered);
                }
                Action::Deliver(message) => {
                    if self.app_events.send(MeshEvent::Message(message)).is_err() {
                        debug!("Application receiver dropped; message discarded");
                    }
                }
                Action::RecordMapping { address, identity } => {
                    if let Err(e) = self.store.record_mapping(&address, &identity).await {
                        error!("Failed to record {} at {}: {:#}", identity, address, e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn refresh_local_address(&mut self) {
        if self.state.local_address().is_none() {
            if let Some(address) = self.supervisor.local_address() {
                self.state.set_local_address(address);
            }
        }
    }

    fn notify(&self, status: LinkStatus) {
        if self.app_events.send(MeshEvent::Status(status)).is_err() {
            debug!("Application receiver dropped; status discarded");
        }
    }
}
