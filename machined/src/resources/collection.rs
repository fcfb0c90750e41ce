use machined_shared::{MachinedError, MachinedResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 256;

/// A resource identified by a string ID.
pub trait Resource: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent<T> {
    Created(T),
    Updated(T),
    Destroyed(T),
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    finalizers: BTreeSet<String>,
}

/// Resources of one kind.
#[derive(Debug)]
pub struct Collection<T: Resource> {
    entries: RwLock<BTreeMap<String, Entry<T>>>,
    events: broadcast::Sender<ResourceEvent<T>>,
}

impl<T: Resource> Default for Collection<T> {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }
}

impl<T: Resource> Collection<T> {
    fn notify(&self, event: ResourceEvent<T>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn create(&self, value: T) -> MachinedResult<()> {
        let id = value.id().to_string();
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(MachinedError::InvalidArgument(format!(
                    "resource {} already exists",
                    id
                )));
            }
            entries.insert(
                id,
                Entry {
                    value: value.clone(),
                    finalizers: BTreeSet::new(),
                },
            );
        }
        self.notify(ResourceEvent::Created(value));
        Ok(())
    }

    pub fn update(&self, value: T) -> MachinedResult<()> {
        let id = value.id().to_string();
        {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(&id)
                .ok_or_else(|| MachinedError::NotFound(format!("resource {}", id)))?;
            entry.value = value.clone();
        }
        self.notify(ResourceEvent::Updated(value));
        Ok(())
    }

    /// Create or update.
    pub fn put(&self, value: T) {
        let id = value.id().to_string();
        let created = {
            let mut entries = self.entries.write();
            match entries.get_mut(&id) {
                Some(entry) => {
                    entry.value = value.clone();
                    false
                }
                None => {
                    entries.insert(
                        id,
                        Entry {
                            value: value.clone(),
                            finalizers: BTreeSet::new(),
                        },
                    );
                    true
                }
            }
        };
        if created {
            self.notify(ResourceEvent::Created(value));
        } else {
            self.notify(ResourceEvent::Updated(value));
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.read().get(id).map(|e| e.value.clone())
    }

    /// All resources ordered by ID.
    pub fn list(&self) -> Vec<T> {
        self.entries.read().values().map(|e| e.value.clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Remove a resource. Fails while finalizers are attached.
    pub fn destroy(&self, id: &str) -> MachinedResult<()> {
        let removed = {
            let mut entries = self.entries.write();
            let entry = entries
                .get(id)
                .ok_or_else(|| MachinedError::NotFound(format!("resource {}", id)))?;
            if !entry.finalizers.is_empty() {
                return Err(MachinedError::Precondition(format!(
                    "resource {} has finalizers {:?}",
                    id, entry.finalizers
                )));
            }
            entries.remove(id).map(|e| e.value)
        };
        if let Some(value) = removed {
            self.notify(ResourceEvent::Destroyed(value));
        }
        Ok(())
    }

    pub fn add_finalizer(&self, id: &str, finalizer: &str) -> MachinedResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| MachinedError::NotFound(format!("resource {}", id)))?;
        entry.finalizers.insert(finalizer.to_string());
        Ok(())
    }

    pub fn remove_finalizer(&self, id: &str, finalizer: &str) -> MachinedResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| MachinedError::NotFound(format!("resource {}", id)))?;
        entry.finalizers.remove(finalizer);
        Ok(())
    }

    pub fn finalizers(&self, id: &str) -> Vec<String> {
        self.entries
            .read()
            .get(id)
            .map(|e| e.finalizers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to changes made after this call.
    pub fn watch(&self) -> broadcast::Receiver<ResourceEvent<T>> {
        self.events.subscribe()
    }
}
