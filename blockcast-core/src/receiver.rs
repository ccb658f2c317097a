//! Receiver: discovers distributors, assembles files, completes the goodbye handshake.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{debug, info, trace, warn, Span};

use crate::error::Result;
use crate::identity::{BlockIdentity, FileIdentity, HostIdentity};
use crate::protocol::{Message, Payload};
use crate::queue::{OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use crate::role::Role;
use crate::transfer::TransferState;
use crate::wire::Datagram;

/// Receiver settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub queue_capacity: usize,
    /// Directory for in-progress staging files.
    pub staging_dir: PathBuf,
    /// Stop once a file is fully synchronized instead of serving forever.
    pub exit_when_synced: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            staging_dir: std::env::temp_dir(),
            exit_when_synced: false,
        }
    }
}

/// The file-fetching role. One [`TransferState`] per file seen on the group.
pub struct Receiver {
    host: HostIdentity,
    transfers: BTreeMap<FileIdentity, TransferState>,
    /// Files whose handshake finished; later traffic for them is ignored.
    synchronized: BTreeSet<FileIdentity>,
    queue: OutboundQueue,
    config: ReceiverConfig,
    span: Span,
}

impl Receiver {
    /// Create the receiver and queue its HELLO.
    pub fn new(host: HostIdentity, config: ReceiverConfig, span: Span) -> Result<Self> {
        let mut receiver = Self {
            host,
            transfers: BTreeMap::new(),
            synchronized: BTreeSet::new(),
            queue: OutboundQueue::new(config.queue_capacity),
            config,
            span,
        };
        {
            let _enter = receiver.span.enter();
            info!(%host, "announcing receiver");
        }
        receiver.send(Payload::Hello { host })?;
        Ok(receiver)
    }

    pub fn host(&self) -> HostIdentity {
        self.host
    }

    pub fn transfer(&self, file: &FileIdentity) -> Option<&TransferState> {
        self.transfers.get(file)
    }

    pub fn is_synchronized(&self, file: &FileIdentity) -> bool {
        self.synchronized.contains(file)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn send(&mut self, payload: Payload<'_>) -> Result<()> {
        let datagram = Message::new(self.host, payload).encode()?;
        self.queue.push(datagram);
        Ok(())
    }

    /// Locate or lazily create the state for `file`.
    fn state(&mut self, file: FileIdentity) -> Result<&mut TransferState> {
        match self.transfers.entry(file) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let state = TransferState::create(file, &self.config.staging_dir)?;
                info!(%file, blocks = file.block_count(), "new transfer");
                Ok(entry.insert(state))
            }
        }
    }

    fn discard_if_synchronized(&mut self, file: &FileIdentity) {
        if self
            .transfers
            .get(file)
            .is_some_and(TransferState::is_fully_synchronized)
        {
            self.transfers.remove(file);
            self.synchronized.insert(*file);
            info!(%file, "fully synchronized");
        }
    }

    /// Ask for everything still missing, as far as the queue has room. The
    /// next SGOODBYE probe picks up whatever did not fit.
    fn request_missing(&mut self, file: FileIdentity) -> Result<()> {
        let host = self.host;
        let Some(state) = self.transfers.get(&file) else {
            return Ok(());
        };
        let needs_info = state.destination().is_none();
        let room = self
            .queue
            .capacity()
            .saturating_sub(self.queue.len() + usize::from(needs_info));
        let missing: Vec<BlockIdentity> = state.missing_blocks().take(room).collect();
        debug!(
            %file,
            remaining = state.remaining_blocks(),
            requesting = missing.len(),
            needs_info,
            "transfer incomplete at distributor goodbye"
        );
        if needs_info {
            self.send(Payload::GetInfo { host })?;
        }
        for block in missing {
            self.send(Payload::GetBlock { block })?;
        }
        Ok(())
    }

    fn dispatch(&mut self, message: Message<'_>) -> Result<()> {
        match message.payload {
            Payload::Info { file, path } => {
                if self.synchronized.contains(&file) {
                    return Ok(());
                }
                info!(%file, path = %path, "received file information");
                self.state(file)?.set_destination(path.into_owned())?;
                self.discard_if_synchronized(&file);
            }
            Payload::Block { block, data } => {
                let file = *block.file();
                if self.synchronized.contains(&file) {
                    return Ok(());
                }
                if !block.in_range() {
                    warn!(%block, "block number past end of file");
                    return Ok(());
                }
                if self.state(file)?.record_block(block.block_num(), data)? {
                    debug!(%block, bytes = data.len(), "received block");
                }
                self.discard_if_synchronized(&file);
            }
            Payload::ServerGoodbye { file, finished } => {
                let listed = finished.contains(&self.host);
                if self.synchronized.contains(&file) {
                    // Our earlier CGOODBYE was lost.
                    if listed {
                        self.send(Payload::Goodbye { host: self.host })?;
                    }
                    return Ok(());
                }
                debug!(%file, listed, "received distributor goodbye");
                if self.state(file)?.is_byte_complete() {
                    if listed {
                        if let Some(state) = self.transfers.get_mut(&file) {
                            state.set_goodbye_received();
                        }
                        self.send(Payload::Goodbye { host: self.host })?;
                    }
                } else {
                    self.request_missing(file)?;
                }
                self.discard_if_synchronized(&file);
            }
            Payload::Hello { .. }
            | Payload::GetInfo { .. }
            | Payload::GetBlock { .. }
            | Payload::Goodbye { .. } => {
                trace!(sender = %message.sender, "ignoring receiver-side message");
            }
        }
        Ok(())
    }
}

impl Role for Receiver {
    fn handle_datagram(&mut self, datagram: &Datagram) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        match Message::decode(datagram)? {
            Some(message) => self.dispatch(message),
            None => {
                warn!(tag = datagram.tag(), sender = %datagram.sender(), "unknown message type");
                Ok(())
            }
        }
    }

    fn has_outbound(&self) -> bool {
        !self.queue.is_empty()
    }

    fn pop_outbound(&mut self) -> Option<Datagram> {
        self.queue.pop()
    }

    /// Never finishes unless configured to stop after the first synchronized
    /// file.
    fn is_finished(&self) -> bool {
        self.config.exit_when_synced && !self.synchronized.is_empty() && self.queue.is_empty()
    }
}
