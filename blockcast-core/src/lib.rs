//! Blockcast protocol core: one distributor serves one file to any number of
//! receivers on a multicast group; every reply is useful to every receiver.
//! Host-driven: no socket I/O; the host feeds datagrams and drains outbound ones.

pub mod distributor;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod role;
pub mod transfer;
pub mod wire;

pub use distributor::{Distributor, DistributorConfig};
pub use error::{Error, Result};
pub use identity::{BlockIdentity, FileIdentity, HostIdentity};
pub use protocol::{Message, MessageType, Payload, BLOCK_SIZE, DEFAULT_GROUP, DEFAULT_PORT};
pub use receiver::{Receiver, ReceiverConfig};
pub use role::Role;
pub use transfer::{Phase, TransferState};
pub use wire::{Datagram, FramingError, MAX_DATAGRAM_LEN};
