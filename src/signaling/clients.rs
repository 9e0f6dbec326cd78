use std::collections::{BTreeSet, HashMap};

use crate::call::{CallId, ParticipantId};
use crate::signaling::types::ClientId;

/// Tracks which connection speaks for which participant, and which
/// participants should hear about each call.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    participant_to_client: HashMap<ParticipantId, ClientId>,
    client_to_participant: HashMap<ClientId, ParticipantId>,
    audiences: HashMap<CallId, BTreeSet<ParticipantId>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `client_id` to `participant_id`.
    ///
    /// Returns the previous connection of this participant, if it was bound
    /// elsewhere (a reconnect). That connection stops receiving messages.
    pub fn bind(&mut self, client_id: ClientId, participant_id: ParticipantId) -> Option<ClientId> {
        if let Some(prev_pid) = self.client_to_participant.remove(&client_id) {
            if self.participant_to_client.get(&prev_pid) == Some(&client_id) {
                self.participant_to_client.remove(&prev_pid);
            }
        }
        let old_client = self
            .participant_to_client
            .insert(participant_id.clone(), client_id)
            .filter(|old| *old != client_id);
        if let Some(old) = old_client {
            self.client_to_participant.remove(&old);
        }
        self.client_to_participant.insert(client_id, participant_id);
        old_client
    }

    /// Forgets a connection; returns the participant it spoke for, if any.
    pub fn unbind(&mut self, client_id: ClientId) -> Option<ParticipantId> {
        let pid = self.client_to_participant.remove(&client_id)?;
        if self.participant_to_client.get(&pid) == Some(&client_id) {
            self.participant_to_client.remove(&pid);
        }
        Some(pid)
    }

    pub fn participant_of(&self, client_id: ClientId) -> Option<&ParticipantId> {
        self.client_to_participant.get(&client_id)
    }

    pub fn client_of(&self, participant_id: &str) -> Option<ClientId> {
        self.participant_to_client.get(participant_id).copied()
    }

    pub fn connected_count(&self) -> usize {
        self.client_to_participant.len()
    }

    // ---- Call audiences ---------------------------------------------------

    pub fn subscribe(&mut self, call_id: &str, participant_id: &str) {
        self.audiences
            .entry(call_id.to_owned())
            .or_default()
            .insert(participant_id.to_owned());
    }

    /// Drops a participant that left. The last one stays subscribed so it
    /// still hears `CallEnded`.
    pub fn unsubscribe(&mut self, call_id: &str, participant_id: &str) {
        if let Some(audience) = self.audiences.get_mut(call_id) {
            if audience.len() > 1 {
                audience.remove(participant_id);
            }
        }
    }

    /// Removes the call and returns whoever was still listening to it.
    pub fn end_call(&mut self, call_id: &str) -> BTreeSet<ParticipantId> {
        self.audiences.remove(call_id).unwrap_or_default()
    }

    pub fn audience(&self, call_id: &str) -> impl Iterator<Item = &ParticipantId> {
        self.audiences.get(call_id).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_a_participant_displaces_the_old_connection() {
        let mut dir = ClientDirectory::new();
        assert_eq!(dir.bind(1, "alice".into()), None);
        assert_eq!(dir.bind(2, "alice".into()), Some(1));
        assert_eq!(dir.client_of("alice"), Some(2));
        assert_eq!(dir.participant_of(1), None);

        // The stale connection closing must not unbind the new one.
        assert_eq!(dir.unbind(1), None);
        assert_eq!(dir.client_of("alice"), Some(2));
        assert_eq!(dir.unbind(2), Some("alice".into()));
        assert_eq!(dir.connected_count(), 0);
    }

    #[test]
    fn rebinding_a_connection_to_another_participant_releases_the_first() {
        let mut dir = ClientDirectory::new();
        dir.bind(1, "alice".into());
        dir.bind(1, "bob".into());
        assert_eq!(dir.client_of("alice"), None);
        assert_eq!(dir.client_of("bob"), Some(1));
    }

    #[test]
    fn last_listener_hears_the_call_end() {
        let mut dir = ClientDirectory::new();
        dir.subscribe("c", "a");
        dir.subscribe("c", "b");
        dir.unsubscribe("c", "a");
        dir.unsubscribe("c", "b");
        assert_eq!(dir.audience("c").collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(dir.end_call("c").into_iter().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(dir.audience("c").count(), 0);
    }
}
