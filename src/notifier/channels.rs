use std::collections::{HashMap, HashSet};

/// Process-unique identifier of a subscriber.
pub type SubscriberId = u64;

/// Result of removing interest from one or more channels.
#[derive(Debug)]
pub struct Removal<L> {
    /// Channels left with no subscriber, sorted.
    pub emptied: Vec<String>,
    /// Listener data released because the subscriber holds no channel anymore.
    pub released: Option<L>,
}

struct ListenerEntry<L> {
    data: L,
    channels: HashSet<String>,
}

/// Channel subscriptions held by the notification hub.
///
/// `channels` and `listeners` are kept as mutual inverses: a subscriber is in
/// `channels[c]` exactly when `c` is in that subscriber's channel set. A
/// channel is present only while someone holds it, and a listener only while
/// it holds at least one channel.
pub struct Subscriptions<L> {
    channels: HashMap<String, HashSet<SubscriberId>>,
    listeners: HashMap<SubscriberId, ListenerEntry<L>>,
}

impl<L> Default for Subscriptions<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> Subscriptions<L> {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Adds `id` to every channel in `channels`.
    ///
    /// `make` builds the listener data the first time `id` is seen. Returns the
    /// channels that had no subscriber before this call, sorted.
    pub fn subscribe<I, F>(&mut self, id: SubscriberId, channels: I, make: F) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
        F: FnOnce() -> L,
    {
        let mut added = Vec::new();
        let mut wanted = channels.into_iter().peekable();
        if wanted.peek().is_none() {
            return added;
        }

        let entry = self
            .listeners
            .entry(id)
            .or_insert_with(|| ListenerEntry {
                data: make(),
                channels: HashSet::new(),
            });

        for channel in wanted {
            if !entry.channels.insert(channel.clone()) {
                continue;
            }
            let holders = self.channels.entry(channel.clone()).or_default();
            if holders.is_empty() {
                added.push(channel);
            }
            holders.insert(id);
        }

        added.sort();
        added
    }

    /// Removes `id` from every channel in `channels` it holds.
    pub fn unsubscribe<I>(&mut self, id: SubscriberId, channels: I) -> Removal<L>
    where
        I: IntoIterator<Item = String>,
    {
        let mut emptied = Vec::new();
        let Some(entry) = self.listeners.get_mut(&id) else {
            return Removal {
                emptied,
                released: None,
            };
        };

        for channel in channels {
            if entry.channels.remove(&channel) && Self::drop_holder(&mut self.channels, &channel, id)
            {
                emptied.push(channel);
            }
        }

        let released = if entry.channels.is_empty() {
            self.listeners.remove(&id).map(|e| e.data)
        } else {
            None
        };

        emptied.sort();
        Removal { emptied, released }
    }

    /// Drops `id` from every channel it holds.
    pub fn remove_listener(&mut self, id: SubscriberId) -> Removal<L> {
        let Some(entry) = self.listeners.remove(&id) else {
            return Removal {
                emptied: Vec::new(),
                released: None,
            };
        };

        let mut emptied: Vec<String> = entry
            .channels
            .into_iter()
            .filter(|channel| Self::drop_holder(&mut self.channels, channel, id))
            .collect();
        emptied.sort();

        Removal {
            emptied,
            released: Some(entry.data),
        }
    }

    /// Returns true if the channel lost its last holder and was removed.
    fn drop_holder(
        channels: &mut HashMap<String, HashSet<SubscriberId>>,
        channel: &str,
        id: SubscriberId,
    ) -> bool {
        let Some(holders) = channels.get_mut(channel) else {
            return false;
        };
        holders.remove(&id);
        if holders.is_empty() {
            channels.remove(channel);
            true
        } else {
            false
        }
    }

    /// Listener data for every subscriber of `channel`.
    pub fn subscribers<'a>(&'a self, channel: &str) -> impl Iterator<Item = &'a L> + 'a {
        self.channels
            .get(channel)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.listeners.get(id).map(|e| &e.data))
    }

    /// Every channel with at least one subscriber, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Channels held by one subscriber, sorted.
    pub fn listener_channels(&self, id: SubscriberId) -> Vec<String> {
        let mut names: Vec<String> = self
            .listeners
            .get(&id)
            .map(|e| e.channels.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn contains_listener(&self, id: SubscriberId) -> bool {
        self.listeners.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
