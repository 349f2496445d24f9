//! Entity registry.
//!
//! Maps server-assigned ids of remote entities to sink handles. The locally
//! controlled entity is never stored here.

use std::collections::HashMap;

use cube_shared::net::{EntityId, EntitySnapshot};

use crate::sink::EntitySink;

/// A replicated remote entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntity<H> {
    pub handle: H,
    /// Last state applied from the server.
    pub snapshot: EntitySnapshot,
}

/// Remote entities by id.
#[derive(Debug)]
pub struct EntityRegistry<H> {
    entities: HashMap<EntityId, RemoteEntity<H>>,
}

impl<H> Default for EntityRegistry<H> {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
        }
    }
}

impl<H> EntityRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns an entity through the sink and records it under `snapshot.id`.
    ///
    /// An existing entry with the same id is replaced, not merged; the sink
    /// keeps whatever it created for the old entry.
    pub fn spawn<S>(&mut self, sink: &mut S, snapshot: EntitySnapshot) -> &H
    where
        S: EntitySink<Handle = H>,
    {
        let handle = sink.on_spawn(&snapshot.id, &snapshot);
        let id = snapshot.id.clone();
        self.entities.insert(id.clone(), RemoteEntity { handle, snapshot });
        &self.entities[&id].handle
    }

    pub fn lookup(&self, id: &EntityId) -> Option<&H> {
        self.entities.get(id).map(|e| &e.handle)
    }

    pub fn get(&self, id: &EntityId) -> Option<&RemoteEntity<H>> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Applies position and color to a known entity.
    ///
    /// Returns `false` and changes nothing when the id is unknown.
    pub fn apply_snapshot<S>(&mut self, sink: &mut S, snapshot: &EntitySnapshot) -> bool
    where
        S: EntitySink<Handle = H>,
    {
        let Some(entity) = self.entities.get_mut(&snapshot.id) else {
            return false;
        };
        sink.on_update_position(&entity.handle, snapshot.position);
        sink.on_update_color(&entity.handle, snapshot.color);
        entity.snapshot.position = snapshot.position;
        entity.snapshot.color = snapshot.color;
        true
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Forgets an entity. The sink keeps whatever it created for it.
    pub fn remove(&mut self, id: &EntityId) -> Option<RemoteEntity<H>> {
        self.entities.remove(id)
    }
}
