//! The seam between a protocol role and the host reactor that drives it.

use crate::error::Result;
use crate::wire::Datagram;

/// A protocol participant driven one reactor turn at a time.
///
/// Each turn the host calls [`Role::pump`], waits for readiness (asking for
/// writability only when [`Role::has_outbound`] holds), feeds at most one
/// received datagram to [`Role::handle_datagram`], sends at most one datagram
/// from [`Role::pop_outbound`], and calls [`Role::on_idle`] once per idle
/// interval.
pub trait Role {
    /// Queue any proactive work (the distributor's initial broadcast).
    fn pump(&mut self) -> Result<()> {
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: &Datagram) -> Result<()>;

    fn on_idle(&mut self) -> Result<()> {
        Ok(())
    }

    fn has_outbound(&self) -> bool;

    fn pop_outbound(&mut self) -> Option<Datagram>;

    /// The run's termination predicate.
    fn is_finished(&self) -> bool;
}
