//! Entity sink.
//!
//! The client never touches rendering or physics state. Everything visible
//! goes through an [`EntitySink`]: an engine integration, or the
//! [`HeadlessSink`] used by the binary and by tests.

use cube_shared::{
    math::{Color, Vec3},
    net::{EntityId, EntitySnapshot},
};

/// Receives replicated entity changes and supplies the local entity's state.
pub trait EntitySink {
    /// Opaque handle to a rendered entity.
    type Handle;

    /// Creates a rendered entity for a remote player.
    fn on_spawn(&mut self, id: &EntityId, snapshot: &EntitySnapshot) -> Self::Handle;

    fn on_update_position(&mut self, handle: &Self::Handle, position: Vec3);

    fn on_update_color(&mut self, handle: &Self::Handle, color: Color);

    /// Current position and color of the locally controlled entity.
    fn on_local_sample(&mut self) -> (Vec3, Color);

    /// The server changed the local entity's color.
    fn on_local_color(&mut self, _color: Color) {}
}

/// Arena index of an entity rendered by [`HeadlessSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(pub usize);

/// What a headless "renderer" knows about one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEntity {
    pub id: EntityId,
    pub position: Vec3,
    pub color: Color,
}

/// Sink without a renderer. Entities live in an arena and are never freed,
/// mirroring a scene where spawned objects stay until the session ends.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSink {
    prefab: String,
    entities: Vec<RenderedEntity>,
    local_position: Vec3,
    local_color: Color,
}

impl HeadlessSink {
    pub fn new(prefab: impl Into<String>) -> Self {
        Self {
            prefab: prefab.into(),
            ..Self::default()
        }
    }

    pub fn prefab(&self) -> &str {
        &self.prefab
    }

    pub fn get(&self, handle: SinkHandle) -> Option<&RenderedEntity> {
        self.entities.get(handle.0)
    }

    /// Every entity ever spawned, including ones orphaned by a re-spawn.
    pub fn entities(&self) -> &[RenderedEntity] {
        &self.entities
    }

    pub fn local_position(&self) -> Vec3 {
        self.local_position
    }

    pub fn local_color(&self) -> Color {
        self.local_color
    }

    /// Moves the local entity, standing in for local prediction.
    pub fn set_local_position(&mut self, position: Vec3) {
        self.local_position = position;
    }

    pub fn set_local_color(&mut self, color: Color) {
        self.local_color = color;
    }
}

impl EntitySink for HeadlessSink {
    type Handle = SinkHandle;

    fn on_spawn(&mut self, id: &EntityId, snapshot: &EntitySnapshot) -> SinkHandle {
        self.entities.push(RenderedEntity {
            id: id.clone(),
            position: snapshot.position,
            color: snapshot.color,
        });
        SinkHandle(self.entities.len() - 1)
    }

    fn on_update_position(&mut self, handle: &SinkHandle, position: Vec3) {
        if let Some(entity) = self.entities.get_mut(handle.0) {
            entity.position = position;
        }
    }

    fn on_update_color(&mut self, handle: &SinkHandle, color: Color) {
        if let Some(entity) = self.entities.get_mut(handle.0) {
            entity.color = color;
        }
    }

    fn on_local_sample(&mut self) -> (Vec3, Color) {
        (self.local_position, self.local_color)
    }

    fn on_local_color(&mut self, color: Color) {
        self.local_color = color;
    }
}
