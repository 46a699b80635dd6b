//! Per-connection authentication state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::protocol::ClientId;
use crate::provider::ProviderId;

/// Upper bound on concurrently-loaded providers. Provider IDs are dense
/// indices below this limit.
pub const MAX_PROVIDERS: usize = 32;

/// State of one provider's work for one client.
///
/// The only permitted transitions are `NotRun -> Running -> Done` and
/// `NotRun -> Done` (synchronous providers). Nothing returns to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotRun,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct ProviderSlot {
    status: SlotStatus,
    deadline: Option<Instant>,
}

/// The record tracked for a connection while its checks are outstanding.
///
/// Owned by the service's client table from creation until the
/// accept/reject decision; provider callbacks receive it by mutable
/// reference for the duration of one callback only.
#[derive(Debug)]
pub struct ClientRecord {
    pub cid: ClientId,
    /// Our side of the connection (the listener the client connected to).
    pub listen_addr: SocketAddr,
    /// The connecting client.
    pub peer_addr: SocketAddr,
    /// Resolved hostname, `*` until reverse DNS succeeds.
    pub hostname: String,
    /// Resolved ident username, `*` until an ident response arrives.
    pub username: String,

    starting: bool,
    cancelled: bool,
    running: usize,
    slots: [ProviderSlot; MAX_PROVIDERS],
}

impl ClientRecord {
    pub fn new(cid: ClientId, listen_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            cid,
            listen_addr,
            peer_addr,
            hostname: "*".to_string(),
            username: "*".to_string(),
            starting: false,
            cancelled: false,
            running: 0,
            slots: [ProviderSlot {
                status: SlotStatus::NotRun,
                deadline: None,
            }; MAX_PROVIDERS],
        }
    }

    pub fn status(&self, pid: ProviderId) -> SlotStatus {
        self.slots[pid.index()].status
    }

    pub fn is_done(&self, pid: ProviderId) -> bool {
        self.status(pid) == SlotStatus::Done
    }

    /// Number of providers currently in `Running` state.
    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn running_ids(&self) -> Vec<ProviderId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SlotStatus::Running)
            .map(|(i, _)| ProviderId::from_index(i))
            .collect()
    }

    /// Mark a provider as having gone asynchronous for this client.
    pub fn mark_running(&mut self, pid: ProviderId) {
        let slot = &mut self.slots[pid.index()];
        debug_assert_eq!(slot.status, SlotStatus::NotRun);
        if slot.status == SlotStatus::NotRun {
            slot.status = SlotStatus::Running;
            self.running += 1;
        }
    }

    /// Force a slot to `Done`, adjusting the running count if it was
    /// running. Returns false if it was already done.
    pub(crate) fn mark_done(&mut self, pid: ProviderId) -> bool {
        let slot = &mut self.slots[pid.index()];
        match slot.status {
            SlotStatus::Done => false,
            SlotStatus::Running => {
                slot.status = SlotStatus::Done;
                slot.deadline = None;
                self.running -= 1;
                true
            }
            SlotStatus::NotRun => {
                slot.status = SlotStatus::Done;
                true
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Transition the cancellation flag. Returns true only on the first
    /// call; cancellation is idempotent.
    pub(crate) fn set_cancelled(&mut self) -> bool {
        if self.cancelled {
            false
        } else {
            self.cancelled = true;
            true
        }
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    pub(crate) fn set_starting(&mut self, starting: bool) {
        self.starting = starting;
    }

    /// Arm (or with `None`, clear) the absolute deadline for a provider's
    /// slot. The periodic sweep fires the provider's `timeout` callback
    /// once the deadline elapses.
    pub fn set_timeout(&mut self, pid: ProviderId, deadline: Option<Instant>) {
        self.slots[pid.index()].deadline = deadline;
    }

    pub fn set_timeout_relative(&mut self, pid: ProviderId, after: Duration) {
        self.set_timeout(pid, Some(Instant::now() + after));
    }

    pub fn deadline(&self, pid: ProviderId) -> Option<Instant> {
        self.slots[pid.index()].deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ClientRecord {
        ClientRecord::new(
            ClientId::new(1).unwrap(),
            "127.0.0.1:6667".parse().unwrap(),
            "203.0.113.5:51000".parse().unwrap(),
        )
    }

    #[test]
    fn running_count_tracks_slots() {
        let mut rec = record();
        let p0 = ProviderId::from_index(0);
        let p1 = ProviderId::from_index(1);

        assert_eq!(rec.running_count(), 0);
        rec.mark_running(p0);
        rec.mark_running(p1);
        assert_eq!(rec.running_count(), 2);
        assert_eq!(rec.running_ids(), vec![p0, p1]);

        assert!(rec.mark_done(p0));
        assert_eq!(rec.running_count(), 1);
        assert!(!rec.mark_done(p0));
        assert_eq!(rec.running_count(), 1);
    }

    #[test]
    fn done_without_running_leaves_count() {
        let mut rec = record();
        let p0 = ProviderId::from_index(0);

        assert!(rec.mark_done(p0));
        assert_eq!(rec.status(p0), SlotStatus::Done);
        assert_eq!(rec.running_count(), 0);
    }

    #[test]
    fn cancellation_latches() {
        let mut rec = record();
        assert!(rec.set_cancelled());
        assert!(!rec.set_cancelled());
        assert!(rec.is_cancelled());
    }

    #[test]
    fn identity_defaults_to_star() {
        let rec = record();
        assert_eq!(rec.hostname, "*");
        assert_eq!(rec.username, "*");
    }
}
