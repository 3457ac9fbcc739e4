//! P2P synchronization using iroh and automerge
//!
//! The automerge document IS the source of truth; this module only ships it
//! between peers. Local changes come in as `SyncCommand::SyncDoc`, merged
//! peer state goes out as `SyncEvent::RemoteChanges`.

pub mod protocol;

use anyhow::{anyhow, Result};
use automerge::Automerge;
use iroh::endpoint::presets;
use iroh::Endpoint;
use iroh_base::EndpointAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use protocol::{SyncHub, ALPN};

/// Prefix of shareable session tickets
pub const TICKET_PREFIX: &str = "irohmap1";

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Active { join_ticket: None },
        }
    }
}

/// Sync operation mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// No syncing, standalone mode
    Disabled,
    /// Always accept connections, optionally join a peer
    Active { join_ticket: Option<String> },
}

/// Events from the sync task
#[derive(Debug)]
pub enum SyncEvent {
    /// Endpoint is up; `ticket` lets others join
    Ready { ticket: String },
    /// A peer sent changes, directly or relayed; this is the merged replica
    RemoteChanges { doc: Automerge },
    Error(String),
}

/// Commands to the sync task
#[derive(Debug)]
pub enum SyncCommand {
    /// Merge local document state and push it to peers
    SyncDoc { doc: Automerge },
    Shutdown,
}

/// Handle for talking to the sync task
pub struct SyncHandle {
    command_tx: mpsc::UnboundedSender<SyncCommand>,
    event_rx: mpsc::UnboundedReceiver<SyncEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.event_rx.recv().await
    }

    pub fn send_command(&self, cmd: SyncCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| anyhow!("sync task has stopped"))
    }

    /// Ask the task to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown);
        if let Err(err) = self.task.await {
            warn!(%err, "sync task panicked");
        }
    }
}

/// Start the sync task on the current runtime.
///
/// Returns `None` when sync is disabled.
pub fn start_sync(config: SyncConfig) -> Option<SyncHandle> {
    let join_ticket = match config.mode {
        SyncMode::Disabled => return None,
        SyncMode::Active { join_ticket } => join_ticket,
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        if let Err(e) = run_sync(join_ticket, event_tx.clone(), command_rx).await {
            let _ = event_tx.send(SyncEvent::Error(format!("{e:#}")));
        }
    });

    Some(SyncHandle {
        command_tx,
        event_rx,
        task,
    })
}

/// Encode an EndpointAddr as a shareable ticket string
pub fn encode_ticket(addr: &EndpointAddr) -> Result<String> {
    let bytes = postcard::to_stdvec(addr)?;
    Ok(format!(
        "{TICKET_PREFIX}{}",
        data_encoding::BASE32_NOPAD.encode(&bytes)
    ))
}

/// Decode a ticket string back to EndpointAddr. A bare endpoint id is also
/// accepted.
pub fn decode_ticket(ticket: &str) -> Result<EndpointAddr> {
    let ticket = ticket.trim();
    if let Some(data) = ticket.strip_prefix(TICKET_PREFIX) {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(data.as_bytes())
            .map_err(|e| anyhow!("invalid ticket encoding: {e}"))?;
        let addr: EndpointAddr =
            postcard::from_bytes(&bytes).map_err(|e| anyhow!("invalid ticket data: {e}"))?;
        Ok(addr)
    } else {
        let id: iroh_base::PublicKey = ticket
            .parse()
            .map_err(|e| anyhow!("invalid endpoint id: {e}"))?;
        Ok(EndpointAddr::new(id))
    }
}

async fn run_sync(
    join_ticket: Option<String>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    mut command_rx: mpsc::UnboundedReceiver<SyncCommand>,
) -> Result<()> {
    // Parse before binding so a bad ticket fails fast
    let join_addr = join_ticket.as_deref().map(decode_ticket).transpose()?;

    // n0 preset = DNS address lookup + Pkarr publisher + default relays
    let endpoint = Endpoint::builder(presets::N0)
        .bind()
        .await?;

    let ticket = encode_ticket(&endpoint.addr())?;
    info!(%ticket, "sync endpoint ready");
    let _ = event_tx.send(SyncEvent::Ready { ticket });

    let (store_tx, mut store_rx) = mpsc::channel(16);
    let hub = SyncHub::new(Automerge::new(), store_tx);

    let router = iroh::protocol::Router::builder(endpoint.clone())
        .accept(ALPN, hub.clone())
        .spawn();

    let join_task = match join_addr {
        Some(addr) => {
            let conn = endpoint.connect(addr, ALPN).await?;
            info!("joined peer session");
            let hub = hub.clone();
            let event_tx = event_tx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = hub.connect(conn).await {
                    warn!(err = %e, "sync loop ended");
                    let _ = event_tx.send(SyncEvent::Error(e.to_string()));
                }
            }))
        }
        None => None,
    };

    loop {
        tokio::select! {
            Some(doc) = store_rx.recv() => {
                if event_tx.send(SyncEvent::RemoteChanges { doc }).is_err() {
                    break;
                }
            }
            cmd = command_rx.recv() => match cmd {
                Some(SyncCommand::SyncDoc { doc }) => {
                    match hub.publish_local(&doc).await {
                        Ok(true) => debug!("local changes offered to peers"),
                        Ok(false) => {}
                        Err(e) => {
                            let _ = event_tx.send(SyncEvent::Error(e.to_string()));
                        }
                    }
                }
                Some(SyncCommand::Shutdown) | None => {
                    debug!("sync shutting down");
                    break;
                }
            },
        }
    }

    if let Some(task) = join_task {
        task.abort();
    }
    router.shutdown().await?;
    Ok(())
}
