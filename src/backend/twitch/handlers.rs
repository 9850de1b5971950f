use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::messages::Topic;

/// Callback receiving the raw `payload.event` of a notification
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Returned by `on`, used to remove the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Per-topic handler lists, kept in registration order
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<Topic, Vec<(HandlerId, EventHandler)>>,
}

impl HandlerRegistry {
    pub fn on(&mut self, topic: Topic, handler: EventHandler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.handlers.entry(topic).or_default().push((id, handler));
        id
    }

    /// Returns whether a handler was removed
    pub fn off(&mut self, topic: Topic, id: HandlerId) -> bool {
        let Some(handlers) = self.handlers.get_mut(&topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        before != handlers.len()
    }

    /// Snapshot for dispatch, so handlers may register or remove handlers
    pub fn handlers_for(&self, topic: Topic) -> Vec<EventHandler> {
        self.handlers
            .get(&topic)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.handlers.get(&topic).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<Topic, usize> = self
            .handlers
            .iter()
            .map(|(topic, handlers)| (*topic, handlers.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        Arc::new(move |_: &serde_json::Value| log.lock().unwrap().push(name))
    }

    #[test]
    fn test_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        registry.on(Topic::Cheer, recorder(&log, "first"));
        registry.on(Topic::Cheer, recorder(&log, "second"));
        registry.on(Topic::Raid, recorder(&log, "raid"));

        for handler in registry.handlers_for(Topic::Cheer) {
            handler(&serde_json::Value::Null);
        }
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_off() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        let first = registry.on(Topic::Follow, recorder(&log, "first"));
        let other = registry.on(Topic::Raid, recorder(&log, "other"));

        assert!(!registry.off(Topic::Follow, other));
        assert!(!registry.off(Topic::Cheer, first));
        assert!(registry.off(Topic::Follow, first));
        assert!(!registry.off(Topic::Follow, first));
        assert_eq!(registry.count(Topic::Follow), 0);
        assert_eq!(registry.count(Topic::Raid), 1);
    }

    #[test]
    fn test_clear() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        registry.on(Topic::ChatMessage, recorder(&log, "chat"));
        registry.clear();
        assert!(registry.handlers_for(Topic::ChatMessage).is_empty());
    }
}
