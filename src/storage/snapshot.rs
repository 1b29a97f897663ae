use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::time::Duration;

use crate::audio::{
    effects::FilterSet,
    player::LoopMode,
    track::{EntryKey, Track},
};

/// Estado persistido de la cola de un guild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub room_id: GuildId,
    pub bot_instance_id: UserId,
    pub text_channel_id: ChannelId,
    pub voice_channel_id: ChannelId,
    pub songs: Vec<SnapshotSong>,
    pub current_song_key: Option<EntryKey>,
    /// Última posición conocida en segundos
    pub current_position: f64,
    #[serde(default)]
    pub settings: PlayerSettings,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSong {
    pub key: EntryKey,
    pub index: u64,
    pub song: Track,
    pub requester_id: UserId,
}

/// Preferencias del reproductor que sobreviven a un reinicio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSettings {
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u32,
    pub filters: FilterSet,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Off,
            shuffle: false,
            volume: 100,
            filters: FilterSet::default(),
        }
    }
}

impl Snapshot {
    /// Offset de reanudación para `key`.
    ///
    /// Sólo se respeta si se reanuda la misma pista que estaba sonando y
    /// `0 <= posición < duración` con duración conocida; si no, se empieza de cero.
    pub fn resume_offset(&self, key: &EntryKey, duration: u64) -> Duration {
        let same_key = self.current_song_key.as_ref() == Some(key);
        let position = self.current_position;

        if same_key
            && duration > 0
            && position.is_finite()
            && position >= 0.0
            && position < duration as f64
        {
            Duration::from_secs_f64(position)
        } else {
            Duration::ZERO
        }
    }
}
