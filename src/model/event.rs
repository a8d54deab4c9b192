use crate::model::{Cached, FactoryKey, Key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapEventKind {
    Insert,
    Update,
    Delete,
    /// End of a batch of changes
    Commit,
    /// The contents changed wholesale; listeners should re-read
    AllRows,
}

/// Change notification delivered to map listeners of a bean factory
#[derive(Debug, Clone)]
pub struct MapEvent {
    /// Factory the event is fired from
    pub source: FactoryKey,
    pub kind: MapEventKind,
    pub key: Option<Key>,
    pub value: Option<Cached>,
}

impl MapEvent {
    pub fn new(
        source: FactoryKey,
        kind: MapEventKind,
        key: Option<Key>,
        value: Option<Cached>,
    ) -> Self {
        Self {
            source,
            kind,
            key,
            value,
        }
    }

    pub fn commit(source: FactoryKey) -> Self {
        Self::new(source, MapEventKind::Commit, None, None)
    }

    pub fn all_rows(source: FactoryKey) -> Self {
        Self::new(source, MapEventKind::AllRows, None, None)
    }

    /// Whether two events describe the same change, used to drop duplicates
    /// from an event queue
    pub fn same_as(&self, other: &MapEvent) -> bool {
        self.source == other.source
            && self.kind == other.kind
            && self.key == other.key
            && match (&self.value, &other.value) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same(b),
                _ => false,
            }
    }
}

pub trait MapListener: Send + Sync {
    fn map_changed(&self, event: &MapEvent) -> anyhow::Result<()>;

    /// Listeners that report false are dropped by the factory
    fn is_alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_commits_are_same() {
        let source = FactoryKey::new("Trade", "default");
        assert!(MapEvent::commit(source.clone()).same_as(&MapEvent::commit(source.clone())));
        assert!(!MapEvent::commit(source.clone()).same_as(&MapEvent::all_rows(source)));
    }
}
