//! # Multi-Instance Coordinator
//!
//! Several bot identities can share the same guilds. Exactly one of them
//! must answer any given command, and every instance has to reach the
//! same answer independently, so the decision is a pure function of a
//! shared [`OwnershipState`].
//!
//! ## Ownership rules (first match wins)
//!
//! 1. The instance holding a live voice connection in the guild owns it.
//! 2. If the requester's voice channel is occupied by a non-primary
//!    instance, that instance owns the request.
//! 3. The primary owns everything else, or the first configured instance
//!    that is a member of the guild when the primary is not.
//!
//! [`Federation`] is the live, in-process registry all identities update
//! from their own gateway events.

use dashmap::DashMap;
use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Vista inmutable del estado compartido
#[derive(Debug, Clone, Default)]
pub struct OwnershipState {
    /// Instancias en orden de configuración; la primera es la primaria
    pub instances: Vec<UserId>,
    pub connections: HashMap<GuildId, UserId>,
    /// Canal de voz ocupado por cada instancia
    pub claims: HashMap<ChannelId, UserId>,
    pub membership: HashMap<UserId, HashSet<GuildId>>,
}

impl OwnershipState {
    pub fn primary(&self) -> Option<UserId> {
        self.instances.first().copied()
    }

    fn is_member(&self, instance: UserId, room: GuildId) -> bool {
        self.membership
            .get(&instance)
            .is_some_and(|guilds| guilds.contains(&room))
    }
}

/// Instancia que debe atender una petición en `room`
pub fn owner_of(
    room: GuildId,
    requester_voice: Option<ChannelId>,
    state: &OwnershipState,
) -> Option<UserId> {
    if let Some(owner) = state.connections.get(&room) {
        return Some(*owner);
    }

    let primary = state.primary()?;

    if let Some(claimant) = requester_voice.and_then(|channel| state.claims.get(&channel)) {
        if *claimant != primary {
            return Some(*claimant);
        }
    }

    if state.is_member(primary, room) {
        return Some(primary);
    }

    state
        .instances
        .iter()
        .copied()
        .find(|instance| state.is_member(*instance, room))
}

pub fn should_respond(
    instance: UserId,
    room: GuildId,
    requester_voice: Option<ChannelId>,
    state: &OwnershipState,
) -> bool {
    owner_of(room, requester_voice, state) == Some(instance)
}

/// Registro compartido entre todas las identidades del proceso
#[derive(Debug, Default)]
pub struct Federation {
    instances: RwLock<Vec<UserId>>,
    connections: DashMap<GuildId, UserId>,
    claims: DashMap<ChannelId, UserId>,
    /// Canal ocupado por cada (instancia, guild), para limpiar su claim al moverse
    seats: DashMap<(UserId, GuildId), ChannelId>,
    membership: DashMap<UserId, HashSet<GuildId>>,
}

impl Federation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra una identidad; el orden de registro fija la primaria
    pub fn register_instance(&self, instance: UserId, guilds: impl IntoIterator<Item = GuildId>) {
        {
            let mut instances = self.instances.write();
            if !instances.contains(&instance) {
                instances.push(instance);
            }
        }
        self.membership.entry(instance).or_default().extend(guilds);
        info!("🤝 Instancia {} registrada en la federación", instance);
    }

    /// Fija el orden de instancias antes de que se conecten
    pub fn set_instance_order(&self, order: Vec<UserId>) {
        *self.instances.write() = order;
    }

    pub fn primary(&self) -> Option<UserId> {
        self.instances.read().first().copied()
    }

    pub fn is_primary(&self, instance: UserId) -> bool {
        self.primary() == Some(instance)
    }

    pub fn instances(&self) -> Vec<UserId> {
        self.instances.read().clone()
    }

    pub fn join_guild(&self, instance: UserId, room: GuildId) {
        self.membership.entry(instance).or_default().insert(room);
    }

    pub fn leave_guild(&self, instance: UserId, room: GuildId) {
        if let Some(mut guilds) = self.membership.get_mut(&instance) {
            guilds.remove(&room);
        }
        self.release_connection(room, instance);
        self.set_voice_channel(instance, room, None);
    }

    pub fn record_connection(&self, room: GuildId, instance: UserId) {
        self.connections.insert(room, instance);
        debug!("Conexión registrada: guild {} -> instancia {}", room, instance);
    }

    /// Sólo libera si la conexión pertenece a `instance`
    pub fn release_connection(&self, room: GuildId, instance: UserId) {
        self.connections.remove_if(&room, |_, owner| *owner == instance);
    }

    pub fn connection_owner(&self, room: GuildId) -> Option<UserId> {
        self.connections.get(&room).map(|owner| *owner)
    }

    /// Actualiza el canal de voz en el que está una instancia
    pub fn set_voice_channel(&self, instance: UserId, room: GuildId, channel: Option<ChannelId>) {
        if let Some((_, previous)) = self.seats.remove(&(instance, room)) {
            self.claims.remove_if(&previous, |_, owner| *owner == instance);
        }
        if let Some(channel) = channel {
            self.seats.insert((instance, room), channel);
            self.claims.entry(channel).or_insert(instance);
        }
    }

    pub fn state(&self) -> OwnershipState {
        OwnershipState {
            instances: self.instances(),
            connections: self
                .connections
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            claims: self
                .claims
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            membership: self
                .membership
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn should_respond(
        &self,
        instance: UserId,
        room: GuildId,
        requester_voice: Option<ChannelId>,
    ) -> bool {
        should_respond(instance, room, requester_voice, &self.state())
    }
}
