//! Single-threaded reactor: one readiness wait per turn, then at most one
//! receive and one send.

use std::time::Duration;

use blockcast_core::{Error, Message, Result, Role};
use tokio::time::Instant;
use tracing::{info, trace, warn};

use crate::channel::MulticastChannel;

/// Drive `role` over `channel` until its termination predicate holds.
/// `idle_interval` paces [`Role::on_idle`]; `None` waits for traffic forever.
pub async fn run<R: Role>(
    role: &mut R,
    channel: &mut MulticastChannel,
    idle_interval: Option<Duration>,
) -> Result<()> {
    let mut next_idle = idle_interval.map(|i| Instant::now() + i);
    loop {
        role.pump()?;
        if role.is_finished() {
            return Ok(());
        }
        let timeout = next_idle.map(|at| at.saturating_duration_since(Instant::now()));
        let readiness = channel.poll(timeout, role.has_outbound()).await?;
        if readiness.is_readable() {
            if let Some(datagram) = channel.receive()? {
                trace!(tag = datagram.tag(), source = ?channel.last_source(), "datagram received");
                role.handle_datagram(&datagram)?;
            }
        }
        if readiness.is_writable() {
            if let Some(datagram) = role.pop_outbound() {
                channel.send(&datagram).await?;
            }
        }
        if let (Some(at), Some(interval)) = (next_idle, idle_interval) {
            if Instant::now() >= at {
                role.on_idle()?;
                next_idle = Some(Instant::now() + interval);
            }
        }
    }
}

/// Log every datagram on the group without taking part. Malformed ones are
/// reported, not fatal. Stops after `limit` datagrams when given.
pub async fn listen(channel: &mut MulticastChannel, limit: Option<usize>) -> Result<usize> {
    let mut seen = 0;
    while limit.map_or(true, |l| seen < l) {
        if !channel.poll(None, false).await?.is_readable() {
            continue;
        }
        let datagram = match channel.receive() {
            Ok(Some(datagram)) => datagram,
            Ok(None) => continue,
            Err(Error::Framing(e)) => {
                seen += 1;
                warn!(source = ?channel.last_source(), "malformed datagram: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        seen += 1;
        let source = channel.last_source();
        match Message::decode(&datagram) {
            Ok(Some(message)) => info!(
                kind = ?message.message_type(),
                sender = %message.sender,
                ?source,
                bytes = datagram.len(),
                "datagram"
            ),
            Ok(None) => info!(
                tag = datagram.tag(),
                sender = %datagram.sender(),
                ?source,
                "unknown message type"
            ),
            Err(e) => warn!(tag = datagram.tag(), ?source, "malformed datagram: {}", e),
        }
    }
    Ok(seen)
}
