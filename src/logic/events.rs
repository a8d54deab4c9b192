use log::debug;

use crate::logic::BeanFactoryRegistry;
use crate::model::MapEvent;

/// Map events held back until a batch of changes is complete, then fired in
/// order from the factories that raised them
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<MapEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. A repeat of the event queued immediately before it
    /// is dropped.
    pub fn push(&mut self, event: MapEvent) {
        if self.events.last().is_some_and(|last| last.same_as(&event)) {
            return;
        }
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[MapEvent] {
        &self.events
    }

    /// Deliver every queued event through the factory it came from
    pub fn fire(self, registry: &BeanFactoryRegistry) {
        for event in self.events {
            match registry.existing_instance(&event.source.type_name, &event.source.data_source) {
                Some(factory) => factory.fire_map_changed(event),
                None => debug!("dropping event for unknown factory {}", event.source),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FactoryKey, Key, MapEventKind};

    #[test]
    fn test_consecutive_duplicates_are_dropped() {
        let source = FactoryKey::new("Trade", "default");
        let mut queue = EventQueue::new();
        queue.push(MapEvent::new(source.clone(), MapEventKind::Insert, Some(Key::from(1)), None));
        queue.push(MapEvent::commit(source.clone()));
        queue.push(MapEvent::commit(source.clone()));
        queue.push(MapEvent::new(source.clone(), MapEventKind::Insert, Some(Key::from(2)), None));
        queue.push(MapEvent::commit(source));
        assert_eq!(queue.len(), 4);
    }
}
