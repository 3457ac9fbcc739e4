//! Automerge sync links over iroh streams.
//!
//! A [`SyncHub`] owns the replica that every link syncs against. Changes
//! that arrive on one link land in the replica, go to the store and wake
//! every other link, so a peer joined through this node also sees the edits
//! of the node's other peers.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use automerge::sync::{self, State as SyncState, SyncDoc};
use automerge::Automerge;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

/// Protocol identifier for iroh
pub const ALPN: &[u8] = b"irohmap/automerge/1";

/// Frames larger than this are treated as a broken peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frames read ahead of the link loop
const READ_AHEAD: usize = 16;

/// Replica shared by all sync links of one endpoint
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub").finish()
    }
}

struct Inner {
    replica: Mutex<Automerge>,
    /// Replica snapshots for the store, sent whenever a peer adds changes
    store_tx: mpsc::Sender<Automerge>,
    /// Bumped whenever the replica gains changes; each link flushes on it
    revision: watch::Sender<u64>,
    next_link: AtomicU64,
}

impl SyncHub {
    pub fn new(replica: Automerge, store_tx: mpsc::Sender<Automerge>) -> Self {
        let (revision, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                replica: Mutex::new(replica),
                store_tx,
                revision,
                next_link: AtomicU64::new(0),
            }),
        }
    }

    /// Fold local document state into the replica. Links are woken only when
    /// it brought changes the replica lacked; returns whether it did.
    pub async fn publish_local(&self, doc: &Automerge) -> Result<bool> {
        let applied = {
            let mut replica = self.inner.replica.lock().await;
            let mut doc = doc.clone();
            !replica.merge(&mut doc)?.is_empty()
        };
        if applied {
            self.bump();
        }
        Ok(applied)
    }

    /// Open a link to a peer we dialled
    pub async fn connect(&self, conn: Connection) -> Result<()> {
        let (send, recv) = conn.open_bi().await?;
        self.serve_link(send, recv).await
    }

    async fn accept_link(&self, conn: Connection) -> Result<()> {
        let (send, recv) = conn.accept_bi().await?;
        self.serve_link(send, recv).await
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    /// Run one link until the peer goes away. Frames are read on their own
    /// task so a flush never interrupts a half-read frame.
    async fn serve_link<S, R>(&self, send: S, recv: R) -> Result<()>
    where
        S: AsyncWrite + Unpin,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let link = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        debug!(link, "sync link up");
        let (frame_tx, frame_rx) = mpsc::channel(READ_AHEAD);
        let reader = tokio::spawn(read_frames(recv, frame_tx));
        let result = self.pump(link, send, frame_rx).await;
        reader.abort();
        debug!(link, "sync link down");
        result
    }

    async fn pump<S: AsyncWrite + Unpin>(
        &self,
        link: u64,
        mut send: S,
        mut frames: mpsc::Receiver<Result<Vec<u8>>>,
    ) -> Result<()> {
        let mut state = SyncState::new();
        let mut revision = self.inner.revision.subscribe();

        self.flush(&mut send, &mut state).await?;

        loop {
            tokio::select! {
                changed = revision.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.flush(&mut send, &mut state).await?;
                }
                frame = frames.recv() => match frame {
                    Some(Ok(bytes)) => {
                        self.absorb(link, &mut state, &bytes).await?;
                        self.flush(&mut send, &mut state).await?;
                    }
                    Some(Err(err)) => {
                        debug!(link, %err, "peer stream closed");
                        break;
                    }
                    None => break,
                },
            }
        }

        Ok(())
    }

    /// Apply one peer message. New changes are handed to the store and
    /// relayed to the other links.
    async fn absorb(&self, link: u64, state: &mut SyncState, bytes: &[u8]) -> Result<()> {
        let message = sync::Message::decode(bytes)?;
        let merged = {
            let mut replica = self.inner.replica.lock().await;
            let before = replica.get_heads();
            replica.receive_sync_message(state, message)?;
            (replica.get_heads() != before).then(|| replica.clone())
        };
        let Some(doc) = merged else {
            return Ok(());
        };

        debug!(link, "peer changes applied");
        self.bump();
        if self.inner.store_tx.send(doc).await.is_err() {
            bail!("store side of sync is gone");
        }
        Ok(())
    }

    /// Write every sync message the peer is owed
    async fn flush<W: AsyncWrite + Unpin>(&self, send: &mut W, state: &mut SyncState) -> Result<()> {
        loop {
            let message = self.inner.replica.lock().await.generate_sync_message(state);
            let Some(message) = message else {
                return Ok(());
            };
            write_frame(send, &message.encode()).await?;
        }
    }
}

impl ProtocolHandler for SyncHub {
    fn accept(&self, conn: Connection) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let hub = self.clone();
        async move {
            hub.accept_link(conn).await.map_err(|e| {
                warn!(err = %e, "incoming sync link failed");
                AcceptError::from_err(std::io::Error::other(e.to_string()))
            })
        }
    }
}

/// Forward frames until the stream ends; the first error is forwarded too
async fn read_frames<R: AsyncRead + Unpin>(mut recv: R, frames: mpsc::Sender<Result<Vec<u8>>>) {
    loop {
        let frame = read_frame(&mut recv).await;
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            return;
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        bail!("sync frame of {} bytes exceeds limit", data.len());
    }
    let len = u32::try_from(data.len())?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        bail!("sync frame of {len} bytes exceeds limit");
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}
