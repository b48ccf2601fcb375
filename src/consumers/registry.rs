use crate::consumers::Handler;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What the application wants to consume: a queue, the server hosting it, the handler
/// processing its messages and how many subscribers to run.
#[derive(Clone)]
pub struct RegistryEntry {
    pub queue_name: String,
    pub server_name: String,
    pub handler: Arc<dyn Handler>,
    /// Desired number of subscribers. Defaults to 1.
    pub subscribers: u16,
}

impl RegistryEntry {
    pub fn new(
        queue_name: impl Into<String>,
        server_name: impl Into<String>,
        handler: impl Handler,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            server_name: server_name.into(),
            handler: Arc::new(handler),
            subscribers: 1,
        }
    }

    #[must_use]
    pub fn with_subscribers(mut self, subscribers: u16) -> Self {
        self.subscribers = subscribers;
        self
    }
}

/// Consumers known to the application, by name.
///
/// Names are iterated in lexicographic order, which keeps command reports stable.
#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. A previous entry with the same name is replaced.
    #[must_use]
    pub fn with_consumer(mut self, name: impl Into<String>, entry: RegistryEntry) -> Self {
        self.insert(name, entry);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: RegistryEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
