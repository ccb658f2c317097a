//! Blockcast protocol: message types, per-type payloads and constants.

use std::borrow::Cow;
use std::net::Ipv4Addr;

use crate::identity::{BlockIdentity, FileIdentity, HostIdentity};
use crate::wire::{Datagram, FixedLayout, FramingError, HEADER_LEN, MAX_DATAGRAM_LEN};

/// Payload size of a full block.
pub const BLOCK_SIZE: usize = 1024;

/// Default multicast group shared by all participants.
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(228, 5, 6, 7);

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 9000;

/// Most finished-host entries one SGOODBYE datagram can carry.
pub const MAX_FINISHED_PER_DATAGRAM: usize =
    (MAX_DATAGRAM_LEN - HEADER_LEN - FileIdentity::SIZE) / HostIdentity::SIZE;

/// Wire type tags. Values are fixed for interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Info = 0,
    Block = 1,
    GetBlock = 2,
    GetInfo = 3,
    ClientGoodbye = 4,
    ServerGoodbye = 5,
    ClientHello = 6,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => MessageType::Info,
            1 => MessageType::Block,
            2 => MessageType::GetBlock,
            3 => MessageType::GetInfo,
            4 => MessageType::ClientGoodbye,
            5 => MessageType::ServerGoodbye,
            6 => MessageType::ClientHello,
            _ => return None,
        })
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Typed payload of each message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    /// A receiver announces itself.
    Hello { host: HostIdentity },
    /// A receiver asks for the file metadata to be re-advertised.
    GetInfo { host: HostIdentity },
    /// File advertisement with the destination path hint.
    Info {
        file: FileIdentity,
        path: Cow<'a, str>,
    },
    /// A receiver asks for one block to be rebroadcast.
    GetBlock { block: BlockIdentity },
    /// One block of file content.
    Block { block: BlockIdentity, data: &'a [u8] },
    /// A receiver is done and leaves.
    Goodbye { host: HostIdentity },
    /// The distributor lists participants it believes finished with `file`.
    ServerGoodbye {
        file: FileIdentity,
        finished: Vec<HostIdentity>,
    },
}

/// A decoded or to-be-encoded message. Borrows body data from its datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub sender: HostIdentity,
    pub payload: Payload<'a>,
}

impl<'a> Message<'a> {
    pub fn new(sender: HostIdentity, payload: Payload<'a>) -> Self {
        Self { sender, payload }
    }

    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Hello { .. } => MessageType::ClientHello,
            Payload::GetInfo { .. } => MessageType::GetInfo,
            Payload::Info { .. } => MessageType::Info,
            Payload::GetBlock { .. } => MessageType::GetBlock,
            Payload::Block { .. } => MessageType::Block,
            Payload::Goodbye { .. } => MessageType::ClientGoodbye,
            Payload::ServerGoodbye { .. } => MessageType::ServerGoodbye,
        }
    }

    /// Encode into a single datagram.
    pub fn encode(&self) -> Result<Datagram, FramingError> {
        let tag = self.message_type().tag();
        let sender = self.sender;
        let datagram = match &self.payload {
            Payload::Hello { host } | Payload::GetInfo { host } | Payload::Goodbye { host } => {
                Datagram::with_metadata(tag, sender, host)
            }
            Payload::Info { file, path } => {
                let mut d = Datagram::with_metadata(tag, sender, file);
                d.push_text(path)?;
                d
            }
            Payload::GetBlock { block } => Datagram::with_metadata(tag, sender, block),
            Payload::Block { block, data } => {
                if data.len() > BLOCK_SIZE {
                    return Err(FramingError::BodyTooLarge {
                        limit: BLOCK_SIZE,
                        actual: data.len(),
                    });
                }
                let mut d = Datagram::with_metadata(tag, sender, block);
                d.push_body(data)?;
                d
            }
            Payload::ServerGoodbye { file, finished } => {
                let mut d = Datagram::with_metadata(tag, sender, file);
                d.push_records(finished)?;
                d
            }
        };
        Ok(datagram)
    }

    /// Decode a validated datagram. Returns `Ok(None)` for an unknown type
    /// tag; layout errors for known types are reported.
    pub fn decode(datagram: &'a Datagram) -> Result<Option<Message<'a>>, FramingError> {
        let Some(kind) = MessageType::from_tag(datagram.tag()) else {
            return Ok(None);
        };
        let payload = match kind {
            MessageType::ClientHello => Payload::Hello {
                host: datagram.metadata()?,
            },
            MessageType::GetInfo => Payload::GetInfo {
                host: datagram.metadata()?,
            },
            MessageType::ClientGoodbye => Payload::Goodbye {
                host: datagram.metadata()?,
            },
            MessageType::Info => Payload::Info {
                file: datagram.metadata()?,
                path: datagram.text(),
            },
            MessageType::GetBlock => Payload::GetBlock {
                block: datagram.metadata()?,
            },
            MessageType::Block => {
                let block = datagram.metadata()?;
                if datagram.body_length() > BLOCK_SIZE {
                    return Err(FramingError::BodyTooLarge {
                        limit: BLOCK_SIZE,
                        actual: datagram.body_length(),
                    });
                }
                Payload::Block {
                    block,
                    data: datagram.body(),
                }
            }
            MessageType::ServerGoodbye => Payload::ServerGoodbye {
                file: datagram.metadata()?,
                finished: datagram.records()?,
            },
        };
        Ok(Some(Message {
            sender: datagram.sender(),
            payload,
        }))
    }
}

/// Build as many SGOODBYE messages as it takes to list every host in
/// `finished` without exceeding the datagram limit.
pub fn server_goodbyes(
    sender: HostIdentity,
    file: FileIdentity,
    finished: &[HostIdentity],
) -> Vec<Message<'static>> {
    finished
        .chunks(MAX_FINISHED_PER_DATAGRAM)
        .map(|hosts| {
            Message::new(
                sender,
                Payload::ServerGoodbye {
                    file,
                    finished: hosts.to_vec(),
                },
            )
        })
        .collect()
}
