//! Reconciliation of server messages against local state.
//!
//! Authority rules:
//! - Remote entities are fully server driven: position and color.
//! - The locally controlled entity takes only its color from the server.
//!   Its position stays with local prediction.
//! - The local id is never a registry key.

use cube_shared::{
    math::{Color, Vec3},
    net::{EntityId, EntitySnapshot, Message},
};
use tracing::{debug, info, trace, warn};

use crate::{registry::EntityRegistry, sink::EntitySink};

/// The entity this client controls.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntityState {
    pub snapshot: EntitySnapshot,
    pub owned: bool,
}

impl LocalEntityState {
    pub fn id(&self) -> &EntityId {
        &self.snapshot.id
    }

    pub fn position(&self) -> Vec3 {
        self.snapshot.position
    }

    pub fn color(&self) -> Color {
        self.snapshot.color
    }
}

/// What applying one message changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub spawned: usize,
    pub updated: usize,
    pub local_color_updated: bool,
    /// Entries that matched nothing or were refused.
    pub ignored: usize,
}

/// Routes decoded messages to the registry and the local entity.
#[derive(Debug)]
pub struct Reconciler<H> {
    registry: EntityRegistry<H>,
    local: Option<LocalEntityState>,
}

impl<H> Default for Reconciler<H> {
    fn default() -> Self {
        Self {
            registry: EntityRegistry::new(),
            local: None,
        }
    }
}

impl<H> Reconciler<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &EntityRegistry<H> {
        &self.registry
    }

    /// `None` until the handshake arrives.
    pub fn local(&self) -> Option<&LocalEntityState> {
        self.local.as_ref()
    }

    fn is_local(&self, id: &EntityId) -> bool {
        self.local.as_ref().is_some_and(|l| l.id() == id)
    }

    pub fn apply<S>(&mut self, sink: &mut S, msg: Message) -> Reconciled
    where
        S: EntitySink<Handle = H>,
    {
        let mut out = Reconciled::default();
        match msg {
            Message::Handshake(hs) => {
                info!(id = %hs.player.id, "Handshake received, local id assigned");
                self.set_local_id(sink, hs.player.id);
            }
            Message::PlayerUpdate(pu) => {
                debug!(id = %pu.player.id, "Player update received");
            }
            Message::ServerUpdate(su) => {
                for entry in &su.players {
                    self.apply_update(sink, entry, &mut out);
                }
                trace!(
                    updated = out.updated,
                    local = out.local_color_updated,
                    "Server update applied"
                );
            }
            Message::SpawnedPlayers(sp) => {
                for entry in sp.players {
                    self.spawn(sink, entry, &mut out);
                }
                info!(count = out.spawned, "Spawned all players from server");
            }
            Message::NewPlayer(np) => {
                info!(id = %np.player.id, "New player joined");
                self.spawn(sink, np.player, &mut out);
            }
        }
        out
    }

    /// Refreshes the local entity from the sink and returns its snapshot.
    pub fn sample_local<S>(&mut self, sink: &mut S) -> Option<EntitySnapshot>
    where
        S: EntitySink<Handle = H>,
    {
        let local = self.local.as_mut()?;
        let (position, color) = sink.on_local_sample();
        local.snapshot.position = position;
        local.snapshot.color = color;
        Some(local.snapshot.clone())
    }

    fn set_local_id<S>(&mut self, sink: &mut S, id: EntityId)
    where
        S: EntitySink<Handle = H>,
    {
        if self.registry.remove(&id).is_some() {
            warn!(id = %id, "Local id was a remote entity, dropped from registry");
        }
        match self.local.as_mut() {
            Some(local) => {
                warn!(old = %local.id(), new = %id, "Repeated handshake, replacing local id");
                local.snapshot.id = id;
            }
            None => {
                let (position, color) = sink.on_local_sample();
                self.local = Some(LocalEntityState {
                    snapshot: EntitySnapshot {
                        id,
                        position,
                        color,
                    },
                    owned: true,
                });
            }
        }
    }

    fn spawn<S>(&mut self, sink: &mut S, entry: EntitySnapshot, out: &mut Reconciled)
    where
        S: EntitySink<Handle = H>,
    {
        if self.is_local(&entry.id) {
            warn!(id = %entry.id, "Refusing to spawn the local entity as remote");
            out.ignored += 1;
            return;
        }
        if self.registry.contains(&entry.id) {
            debug!(id = %entry.id, "Re-spawn replaces existing entity");
        }
        self.registry.spawn(sink, entry);
        out.spawned += 1;
    }

    fn apply_update<S>(&mut self, sink: &mut S, entry: &EntitySnapshot, out: &mut Reconciled)
    where
        S: EntitySink<Handle = H>,
    {
        if let Some(local) = self.local.as_mut().filter(|l| l.snapshot.id == entry.id) {
            local.snapshot.color = entry.color;
            sink.on_local_color(entry.color);
            out.local_color_updated = true;
            return;
        }
        if self.registry.apply_snapshot(sink, entry) {
            out.updated += 1;
        } else {
            trace!(id = %entry.id, "Update for unknown entity dropped");
            out.ignored += 1;
        }
    }
}
