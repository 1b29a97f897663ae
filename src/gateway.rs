//! # Gateway Seams
//!
//! Interfaces between the queue engine and the chat platform.
//!
//! The engine never talks to serenity or songbird directly; it goes
//! through these traits so the state machine, restore protocol and
//! coordinator can be exercised with in-memory fakes. The Discord
//! implementations live in [`crate::bot::discord`].
//!
//! Player notifications flow the other way as [`RoomSignal`] values on
//! an mpsc channel, drained by one signal loop per bot identity.

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use crate::{
    error::{ConnectionError, StreamError},
    sources::AudioStream,
};

/// Tipo de canal relevante para la restauración
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Voice,
    Other,
}

/// Notificaciones del reproductor hacia el motor de colas
#[derive(Debug, Clone, PartialEq)]
pub enum RoomSignal {
    TrackEnded { guild: GuildId, generation: u64 },
    TrackFailed { guild: GuildId, generation: u64, reason: String },
    /// La identidad salió de `channel`; sólo afecta a la cola conectada ahí
    ConnectionLost { guild: GuildId, channel: ChannelId },
}

pub type SignalSender = mpsc::UnboundedSender<RoomSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<RoomSignal>;

/// Petición para construir un recurso reproducible
pub struct PlayRequest {
    pub guild: GuildId,
    pub generation: u64,
    pub stream: AudioStream,
    /// Posición inicial dentro de la pista
    pub seek: Duration,
    /// Cadena `-af` de ffmpeg con los filtros activos
    pub filters: Option<String>,
    pub live: bool,
}

/// Recurso en reproducción sobre una conexión de voz
#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    fn pause(&self) -> Result<(), StreamError>;
    fn resume(&self) -> Result<(), StreamError>;
    fn stop(&self);
    fn set_gain(&self, gain: f32) -> Result<(), StreamError>;
    /// Posición absoluta dentro de la pista (incluye el seek inicial)
    async fn position(&self) -> Option<Duration>;
}

/// Conexión de voz activa en un guild
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel_id(&self) -> ChannelId;
    async fn play(&self, request: PlayRequest) -> Result<Box<dyn PlaybackHandle>, StreamError>;
    async fn disconnect(&self);
}

/// Operaciones del gateway que consume el motor
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Id de usuario de esta identidad del bot
    fn instance_id(&self) -> UserId;

    async fn channel_kind(&self, guild: GuildId, channel: ChannelId) -> Option<ChannelKind>;

    /// Usuarios humanos conectados al canal de voz
    async fn voice_occupants(&self, guild: GuildId, channel: ChannelId) -> usize;

    /// `true` si el usuario sigue siendo miembro del guild
    async fn resolve_member(&self, guild: GuildId, user: UserId) -> bool;

    async fn join_voice(
        &self,
        guild: GuildId,
        channel: ChannelId,
        signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectionError>;

    async fn send_message(&self, channel: ChannelId, content: String) -> anyhow::Result<()>;
}
