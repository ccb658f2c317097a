//! Distributor: serves one file to the group and answers retransmission requests.
//!
//! Stages of a run:
//!
//! 1. advertise the file (one INFO),
//! 2. stream every block once, keeping at most `broadcast_window` queued,
//! 3. drain: answer HELLO / GETINFO / GETBLOCK / CGOODBYE, probing idle
//!    participants with SGOODBYE until none remain and the queue is empty.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn, Span};

use crate::error::{Error, Result};
use crate::identity::{BlockIdentity, FileIdentity, HostIdentity};
use crate::integrity;
use crate::protocol::{self, Message, MessageType, Payload, BLOCK_SIZE};
use crate::queue::{OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use crate::role::Role;
use crate::wire::Datagram;

/// Initial-broadcast window, in queued datagrams.
pub const DEFAULT_BROADCAST_WINDOW: usize = 5;

/// Unanswered finish probes before a participant is evicted.
pub const DEFAULT_MAX_MISSED_PROBES: u32 = 5;

/// Distributor tuning.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub queue_capacity: usize,
    pub broadcast_window: usize,
    pub max_missed_probes: u32,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            broadcast_window: DEFAULT_BROADCAST_WINDOW,
            max_missed_probes: DEFAULT_MAX_MISSED_PROBES,
        }
    }
}

/// The file-serving role. Owns the source file and the participant set.
pub struct Distributor {
    host: HostIdentity,
    file: FileIdentity,
    source_path: PathBuf,
    source: File,
    destination_hint: String,
    /// Participant -> consecutive finish probes left unanswered.
    participants: BTreeMap<HostIdentity, u32>,
    queue: OutboundQueue,
    /// Next block of the initial broadcast; `None` once all were queued.
    cursor: Option<BlockIdentity>,
    broadcast_window: usize,
    max_missed_probes: u32,
    span: Span,
}

impl Distributor {
    /// Identify and open `source_path`, then queue the initial INFO.
    pub fn open(
        host: HostIdentity,
        source_path: &Path,
        destination_hint: impl Into<String>,
        config: DistributorConfig,
        span: Span,
    ) -> Result<Self> {
        let file = integrity::identify_file(source_path)?;
        let source = File::open(source_path).map_err(|e| Error::file_io(source_path, e))?;
        let queue = OutboundQueue::new(config.queue_capacity);
        let broadcast_window = config.broadcast_window.clamp(1, queue.capacity());
        let mut distributor = Self {
            host,
            file,
            source_path: source_path.to_path_buf(),
            source,
            destination_hint: destination_hint.into(),
            participants: BTreeMap::new(),
            queue,
            cursor: file.block(0),
            broadcast_window,
            max_missed_probes: config.max_missed_probes.max(1),
            span,
        };
        {
            let _enter = distributor.span.enter();
            info!(
                source = %distributor.source_path.display(),
                %file,
                blocks = file.block_count(),
                "serving file"
            );
        }
        distributor.enqueue_info()?;
        Ok(distributor)
    }

    pub fn host(&self) -> HostIdentity {
        self.host
    }

    pub fn file(&self) -> &FileIdentity {
        &self.file
    }

    pub fn participants(&self) -> impl Iterator<Item = &HostIdentity> {
        self.participants.keys()
    }

    /// True while the initial broadcast still has blocks to queue.
    pub fn is_streaming(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn enqueue_info(&mut self) -> Result<()> {
        let info = Message::new(
            self.host,
            Payload::Info {
                file: self.file,
                path: self.destination_hint.as_str().into(),
            },
        );
        self.queue.push(info.encode()?);
        Ok(())
    }

    /// Queue one block, read straight from the source file into the datagram.
    fn enqueue_block(&mut self, block: BlockIdentity) -> Result<()> {
        let mut datagram = Datagram::with_metadata(MessageType::Block.tag(), self.host, &block);
        self.source
            .seek(SeekFrom::Start(block.byte_offset()))
            .and_then(|_| datagram.fill_body_from(&mut self.source, BLOCK_SIZE))
            .map_err(|e| Error::file_io(&self.source_path, e))?;
        debug!(%block, bytes = datagram.body_length(), "enqueueing block");
        self.queue.push(datagram);
        Ok(())
    }

    /// Record activity from `host`, adding it if new.
    fn touch(&mut self, host: HostIdentity) {
        if self.participants.insert(host, 0).is_none() {
            debug!(%host, "participant joined");
        }
    }

    fn dispatch(&mut self, message: Message<'_>) -> Result<()> {
        match message.payload {
            Payload::Hello { host } => self.touch(host),
            Payload::GetInfo { host } => {
                self.touch(host);
                debug!(%host, "file information requested");
                self.enqueue_info()?;
            }
            Payload::GetBlock { block } => {
                self.touch(message.sender);
                if *block.file() != self.file {
                    trace!(%block, "request for a file served elsewhere");
                } else if !block.in_range() {
                    warn!(%block, sender = %message.sender, "request for block past end of file");
                } else {
                    debug!(%block, sender = %message.sender, "block requested");
                    self.enqueue_block(block)?;
                }
            }
            Payload::Goodbye { host } => {
                if self.participants.remove(&host).is_some() {
                    info!(%host, remaining = self.participants.len(), "participant finished");
                }
            }
            Payload::Info { .. } | Payload::Block { .. } | Payload::ServerGoodbye { .. } => {
                trace!(sender = %message.sender, "ignoring distributor-side message");
            }
        }
        Ok(())
    }
}

impl Role for Distributor {
    fn pump(&mut self) -> Result<()> {
        while self.queue.len() < self.broadcast_window {
            let Some(block) = self.cursor else {
                break;
            };
            let span = self.span.clone();
            let _enter = span.enter();
            self.enqueue_block(block)?;
            self.cursor = block.next();
            if self.cursor.is_none() {
                info!(blocks = self.file.block_count(), "initial broadcast queued");
            }
        }
        Ok(())
    }

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

    /// Probe every participant with SGOODBYE once streaming is over and the
    /// queue has drained; evict those that stopped answering.
    fn on_idle(&mut self) -> Result<()> {
        if self.is_streaming() || !self.queue.is_empty() || self.participants.is_empty() {
            return Ok(());
        }
        let span = self.span.clone();
        let _enter = span.enter();
        let limit = self.max_missed_probes;
        self.participants.retain(|host, missed| {
            let alive = *missed < limit;
            if !alive {
                warn!(%host, probes = *missed, "evicting unresponsive participant");
            }
            alive
        });
        if self.participants.is_empty() {
            return Ok(());
        }
        let hosts: Vec<HostIdentity> = self.participants.keys().copied().collect();
        for missed in self.participants.values_mut() {
            *missed += 1;
        }
        debug!(participants = hosts.len(), "sending finish probe");
        for goodbye in protocol::server_goodbyes(self.host, self.file, &hosts) {
            self.queue.push(goodbye.encode()?);
        }
        Ok(())
    }

    fn has_outbound(&self) -> bool {
        !self.queue.is_empty()
    }

    fn pop_outbound(&mut self) -> Option<Datagram> {
        self.queue.pop()
    }

    fn is_finished(&self) -> bool {
        !self.is_streaming() && self.queue.is_empty() && self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f
    }

    fn distributor(src: &tempfile::NamedTempFile) -> Distributor {
        Distributor::open(
            HostIdentity::new(1),
            src.path(),
            "out.bin",
            DistributorConfig::default(),
            Span::none(),
        )
        .unwrap()
    }

    fn decode_all(d: &mut Distributor) -> Vec<(MessageType, Option<u32>, usize)> {
        let mut out = Vec::new();
        while let Some(datagram) = d.pop_outbound() {
            let msg = Message::decode(&datagram).unwrap().unwrap();
            let block = match &msg.payload {
                Payload::Block { block, .. } => Some(block.block_num()),
                _ => None,
            };
            out.push((msg.message_type(), block, datagram.body_length()));
        }
        out
    }

    fn inbound(msg: Message<'_>) -> Datagram {
        Datagram::parse(msg.encode().unwrap().as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn advertises_then_streams_within_window() {
        let src = source(10 * BLOCK_SIZE);
        let mut d = distributor(&src);
        assert_eq!(d.queued(), 1);
        d.pump().unwrap();
        assert_eq!(d.queued(), DEFAULT_BROADCAST_WINDOW);
        let sent = decode_all(&mut d);
        assert_eq!(sent[0].0, MessageType::Info);
        assert_eq!(sent[1], (MessageType::Block, Some(0), BLOCK_SIZE));
        assert!(d.is_streaming());
    }

    #[test]
    fn streams_every_block_once_with_short_tail() {
        let src = source(2 * BLOCK_SIZE + 100);
        let mut d = distributor(&src);
        let mut blocks = Vec::new();
        while d.is_streaming() || d.has_outbound() {
            d.pump().unwrap();
            for (kind, block, len) in decode_all(&mut d) {
                if kind == MessageType::Block {
                    blocks.push((block.unwrap(), len));
                }
            }
        }
        assert_eq!(blocks, vec![(0, BLOCK_SIZE), (1, BLOCK_SIZE), (2, 100)]);
        assert!(d.is_finished());
    }

    #[test]
    fn getblock_rebroadcasts_and_registers_sender() {
        let src = source(3 * BLOCK_SIZE);
        let mut d = distributor(&src);
        decode_all(&mut d);
        let block = d.file().block(1).unwrap();
        let req = inbound(Message::new(HostIdentity::new(9), Payload::GetBlock { block }));
        d.handle_datagram(&req).unwrap();
        assert_eq!(d.participants().copied().collect::<Vec<_>>(), vec![HostIdentity::new(9)]);
        assert_eq!(decode_all(&mut d), vec![(MessageType::Block, Some(1), BLOCK_SIZE)]);
    }

    #[test]
    fn getblock_for_foreign_file_is_ignored() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        decode_all(&mut d);
        let foreign = FileIdentity::new([0xee; 32], 4).block(2).unwrap();
        let req = inbound(Message::new(
            HostIdentity::new(9),
            Payload::GetBlock { block: foreign },
        ));
        d.handle_datagram(&req).unwrap();
        assert!(!d.has_outbound());
    }

    #[test]
    fn getinfo_readvertises() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        decode_all(&mut d);
        let host = HostIdentity::new(4);
        d.handle_datagram(&inbound(Message::new(host, Payload::GetInfo { host })))
            .unwrap();
        assert_eq!(decode_all(&mut d), vec![(MessageType::Info, None, 7)]);
    }

    #[test]
    fn goodbye_removes_participant_and_finishes() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        d.pump().unwrap();
        decode_all(&mut d);
        let host = HostIdentity::new(4);
        d.handle_datagram(&inbound(Message::new(host, Payload::Hello { host })))
            .unwrap();
        assert!(!d.is_finished());
        d.handle_datagram(&inbound(Message::new(host, Payload::Goodbye { host })))
            .unwrap();
        assert!(d.is_finished());
    }

    #[test]
    fn idle_probes_then_evicts_silent_participant() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        d.pump().unwrap();
        decode_all(&mut d);
        let host = HostIdentity::new(4);
        d.handle_datagram(&inbound(Message::new(host, Payload::Hello { host })))
            .unwrap();

        for _ in 0..DEFAULT_MAX_MISSED_PROBES {
            d.on_idle().unwrap();
            let sent = d.pop_outbound().unwrap();
            match Message::decode(&sent).unwrap().unwrap().payload {
                Payload::ServerGoodbye { finished, .. } => assert_eq!(finished, vec![host]),
                other => panic!("expected SGOODBYE, got {:?}", other),
            }
        }
        d.on_idle().unwrap();
        assert!(!d.has_outbound());
        assert!(d.is_finished());
    }

    #[test]
    fn activity_resets_probe_count() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        d.pump().unwrap();
        decode_all(&mut d);
        let host = HostIdentity::new(4);
        for _ in 0..(DEFAULT_MAX_MISSED_PROBES * 2) {
            d.handle_datagram(&inbound(Message::new(host, Payload::Hello { host })))
                .unwrap();
            d.on_idle().unwrap();
            decode_all(&mut d);
        }
        assert_eq!(d.participants().count(), 1);
    }

    #[test]
    fn no_probe_while_streaming() {
        let src = source(20 * BLOCK_SIZE);
        let mut d = distributor(&src);
        let host = HostIdentity::new(4);
        d.handle_datagram(&inbound(Message::new(host, Payload::Hello { host })))
            .unwrap();
        decode_all(&mut d);
        d.on_idle().unwrap();
        assert!(!d.has_outbound());
    }

    #[test]
    fn unknown_type_is_dropped() {
        let src = source(BLOCK_SIZE);
        let mut d = distributor(&src);
        decode_all(&mut d);
        let odd = Datagram::header_only(99, HostIdentity::new(3));
        d.handle_datagram(&odd).unwrap();
        assert!(!d.has_outbound());
    }

    #[test]
    fn missing_source_is_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Distributor::open(
            HostIdentity::new(1),
            &dir.path().join("nope"),
            "x",
            DistributorConfig::default(),
            Span::none(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::FileIo { .. }));
    }
}
