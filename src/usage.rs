use crate::collaborators::{ClientId, UsageAccounting};
use std::collections::BTreeMap;

/// Reference-counted table of callers using the engine
#[derive(Debug, Default, Clone)]
pub struct ClientUsageTable {
    clients: BTreeMap<ClientId, u32>,
}

impl ClientUsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this is the first reference for `client`.
    pub fn add(&mut self, client: ClientId) -> bool {
        let count = self.clients.entry(client).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the last reference for `client` was dropped.
    pub fn remove(&mut self, client: ClientId) -> bool {
        match self.clients.get_mut(&client) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.clients.remove(&client);
                true
            }
            None => {
                log::warn!("Unneeded remove for client {:?}", client);
                false
            }
        }
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn ref_count(&self, client: ClientId) -> u32 {
        self.clients.get(&client).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    /// Attribute an engine on/off edge to every registered client.
    pub fn note_all(&self, accounting: &dyn UsageAccounting, engine_on: bool) {
        for client in self.clients() {
            note(accounting, client, engine_on);
        }
    }
}

/// Failures are logged and otherwise ignored.
pub fn note(accounting: &dyn UsageAccounting, client: ClientId, engine_on: bool) {
    let result = if engine_on {
        accounting.note_engine_on(client)
    } else {
        accounting.note_engine_off(client)
    };
    if let Err(e) = result {
        log::debug!("Usage accounting failed for {:?}: {}", client, e);
    }
}
