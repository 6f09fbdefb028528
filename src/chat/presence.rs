// Presence tracking
// Applies server-pushed presence to the contact directory

use log::{debug, info};

use super::connection::ConnectionState;
use super::roster::ContactDirectory;
use crate::models::ContactStatus;

/// Annotates directory entries with the presence the server pushes.
///
/// Presence for contacts the directory does not know yet is dropped rather
/// than buffered; a roster load that races ahead of presence simply shows
/// the contact offline until the next presence event.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    applied: u64,
    dropped: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new status when the directory entry changed.
    pub fn on_presence(
        &mut self,
        directory: &mut ContactDirectory,
        contact_id: &str,
        status: &str,
    ) -> Option<ContactStatus> {
        if !directory.contains(contact_id) {
            self.dropped += 1;
            debug!("Dropping presence for unknown contact {}", contact_id);
            return None;
        }
        self.applied += 1;
        let status = ContactStatus::from_wire(status);
        if directory.apply_presence(contact_id, status) {
            debug!("{} is now {:?}", contact_id, status);
            Some(status)
        } else {
            None
        }
    }

    /// Presence learned on an earlier connection is stale once the link is
    /// re-established or given up; every contact falls back to offline until
    /// the server pushes fresh presence. Returns the ids that changed.
    pub fn on_connection_state(
        &mut self,
        directory: &mut ContactDirectory,
        state: &ConnectionState,
    ) -> Vec<String> {
        match state {
            ConnectionState::Connected | ConnectionState::Disconnected(_) => {
                let changed = directory.mark_all_offline();
                if !changed.is_empty() {
                    info!("Reset presence of {} contacts after {:?}", changed.len(), state);
                }
                changed
            }
            _ => Vec::new(),
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
