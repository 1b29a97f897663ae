use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use super::{
    effects::{volume_to_gain, AudioFilter, FilterSet},
    queue::TrackCollection,
    track::{EntryKey, QueueEntry, Track},
};
use crate::{
    error::StreamError,
    gateway::{PlayRequest, PlaybackHandle, VoiceConnection},
    sources::StreamResolver,
    storage::{PlayerSettings, Snapshot, SnapshotSong},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopMode {
    Off,
    Song,
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::Off => f.write_str("➡️ Desactivado"),
            LoopMode::Song => f.write_str("🔂 Canción"),
            LoopMode::Queue => f.write_str("🔁 Cola"),
        }
    }
}

/// Recurso activo: sólo existe mientras se reproduce o está en pausa
pub struct ActiveTrack {
    pub key: EntryKey,
    pub index: u64,
    pub generation: u64,
    handle: Box<dyn PlaybackHandle>,
}

pub enum PlayerState {
    Idle,
    Playing(ActiveTrack),
    Paused(ActiveTrack),
    Destroyed,
}

/// Vista sin datos del estado del reproductor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    Destroyed,
}

/// Resultado de una transición de reproducción
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Se construyó un recurso nuevo para esta entrada
    Playing(EntryKey),
    /// No hay siguiente entrada pero la colección no está vacía
    Idle,
    /// La colección quedó vacía
    Exhausted,
}

/// Fallo al construir el recurso de una entrada concreta
#[derive(Debug)]
pub struct AdvanceFailure {
    pub key: EntryKey,
    pub index: u64,
    pub title: String,
    pub error: StreamError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishReason {
    Natural,
    Skipped,
    Failed,
}

/// Exclusión mutua de un solo hueco para los saltos
#[derive(Debug, Clone, Default)]
pub struct SkipGuard(Arc<AtomicBool>);

impl SkipGuard {
    pub fn can_skip(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }

    /// Reserva el salto; `None` si ya hay uno en curso
    pub fn start(&self) -> Option<SkipPermit> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SkipPermit(Arc::clone(&self.0)))
    }
}

/// Se libera el guard al soltar el permiso
#[derive(Debug)]
pub struct SkipPermit(Arc<AtomicBool>);

impl Drop for SkipPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Máquina de estados de reproducción de un guild
pub struct RoomQueue {
    guild: GuildId,
    text_channel: ChannelId,
    tracks: TrackCollection,
    state: PlayerState,
    loop_mode: LoopMode,
    shuffle: bool,
    volume: u32,
    filters: FilterSet,
    skip_guard: SkipGuard,
    skip_voters: HashSet<UserId>,
    connection: Arc<dyn VoiceConnection>,
    resolver: Arc<StreamResolver>,
    generation: u64,
    consecutive_failures: u8,
}

impl RoomQueue {
    pub fn new(
        guild: GuildId,
        text_channel: ChannelId,
        connection: Arc<dyn VoiceConnection>,
        resolver: Arc<StreamResolver>,
        settings: PlayerSettings,
    ) -> Self {
        Self {
            guild,
            text_channel,
            tracks: TrackCollection::new(),
            state: PlayerState::Idle,
            loop_mode: settings.loop_mode,
            shuffle: settings.shuffle,
            volume: settings.volume,
            filters: settings.filters,
            skip_guard: SkipGuard::default(),
            skip_voters: HashSet::new(),
            connection,
            resolver,
            generation: 0,
            consecutive_failures: 0,
        }
    }

    // Getters

    pub fn guild(&self) -> GuildId {
        self.guild
    }

    pub fn text_channel(&self) -> ChannelId {
        self.text_channel
    }

    pub fn voice_channel(&self) -> ChannelId {
        self.connection.channel_id()
    }

    pub fn tracks(&self) -> &TrackCollection {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut TrackCollection {
        &mut self.tracks
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn skip_guard(&self) -> SkipGuard {
        self.skip_guard.clone()
    }

    pub fn settings(&self) -> PlayerSettings {
        PlayerSettings {
            loop_mode: self.loop_mode,
            shuffle: self.shuffle,
            volume: self.volume,
            filters: self.filters.clone(),
        }
    }

    pub fn status(&self) -> PlayerStatus {
        match self.state {
            PlayerState::Idle => PlayerStatus::Idle,
            PlayerState::Playing(_) => PlayerStatus::Playing,
            PlayerState::Paused(_) => PlayerStatus::Paused,
            PlayerState::Destroyed => PlayerStatus::Destroyed,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, PlayerState::Destroyed)
    }

    fn active(&self) -> Option<&ActiveTrack> {
        match &self.state {
            PlayerState::Playing(active) | PlayerState::Paused(active) => Some(active),
            _ => None,
        }
    }

    pub fn current_key(&self) -> Option<&EntryKey> {
        self.active().map(|active| &active.key)
    }

    pub fn current_entry(&self) -> Option<&QueueEntry> {
        self.current_key().and_then(|key| self.tracks.get(key))
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.active().map(|active| active.generation)
    }

    pub async fn position(&self) -> Option<Duration> {
        match self.active() {
            Some(active) => active.handle.position().await,
            None => None,
        }
    }

    // Cola

    pub fn add(&mut self, track: Track, requester: UserId) -> EntryKey {
        self.tracks.add(track, requester)
    }

    pub fn is_current(&self, key: &EntryKey) -> bool {
        self.current_key() == Some(key)
    }

    /// Elimina una entrada; si es la actual, el llamador debe saltarla
    pub fn remove(&mut self, key: &EntryKey) -> Option<QueueEntry> {
        self.tracks.delete(key)
    }

    // Transiciones

    /// Construye el recurso de `key` (o de la entrada de menor índice) y lo reproduce
    pub async fn advance(
        &mut self,
        key: Option<EntryKey>,
        seek: Duration,
    ) -> Result<Transition, AdvanceFailure> {
        if self.is_destroyed() {
            return Ok(Transition::Exhausted);
        }

        if let Some(previous) = self.take_active() {
            previous.handle.stop();
        }

        let entry = key
            .and_then(|key| self.tracks.get(&key).cloned())
            .or_else(|| self.tracks.first().cloned());

        let Some(entry) = entry else {
            debug!("Cola vacía para guild {}", self.guild);
            return Ok(Transition::Exhausted);
        };

        self.start(entry, seek).await
    }

    /// Fin natural de la pista; `None` si la notificación es de un recurso viejo
    pub async fn handle_track_end(
        &mut self,
        generation: u64,
    ) -> Option<Result<Transition, AdvanceFailure>> {
        if self.current_generation() != Some(generation) {
            debug!("Fin de pista obsoleto (gen {}) en guild {}", generation, self.guild);
            return None;
        }

        let finished = self.take_active()?;
        self.consecutive_failures = 0;
        info!("🏁 Pista terminada en guild {}", self.guild);
        Some(
            self.finish_and_advance(&finished.key, finished.index, FinishReason::Natural)
                .await,
        )
    }

    /// Error del recurso activo; se convierte en un fallo de la entrada actual
    pub fn handle_track_error(&mut self, generation: u64, reason: String) -> Option<AdvanceFailure> {
        if self.current_generation() != Some(generation) {
            return None;
        }

        let failed = self.take_active()?;
        failed.handle.stop();
        let title = self
            .tracks
            .get(&failed.key)
            .map(|entry| entry.track.title.clone())
            .unwrap_or_default();

        Some(AdvanceFailure {
            key: failed.key,
            index: failed.index,
            title,
            error: StreamError::Playback(reason),
        })
    }

    /// Tras un fallo, avanza con la misma política que el fin natural
    pub async fn recover_from_failure(
        &mut self,
        failure: &AdvanceFailure,
    ) -> Result<Transition, AdvanceFailure> {
        self.finish_and_advance(&failure.key, failure.index, FinishReason::Failed)
            .await
    }

    /// Cuenta un fallo consecutivo y devuelve el total
    pub fn record_failure(&mut self) -> u8 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Salta la pista actual; en Idle arranca la primera entrada
    pub async fn skip(&mut self) -> Result<Transition, AdvanceFailure> {
        match self.take_active() {
            Some(active) => {
                active.handle.stop();
                self.skip_voters.clear();
                info!("⏭️ Saltando pista en guild {}", self.guild);
                self.finish_and_advance(&active.key, active.index, FinishReason::Skipped)
                    .await
            }
            None => self.advance(None, Duration::ZERO).await,
        }
    }

    pub fn pause(&mut self) -> Result<bool, StreamError> {
        match std::mem::replace(&mut self.state, PlayerState::Idle) {
            PlayerState::Playing(active) => {
                if let Err(e) = active.handle.pause() {
                    self.state = PlayerState::Playing(active);
                    return Err(e);
                }
                info!("⏸️ Reproducción pausada en guild {}", self.guild);
                self.state = PlayerState::Paused(active);
                Ok(true)
            }
            other => {
                self.state = other;
                Ok(false)
            }
        }
    }

    pub fn resume(&mut self) -> Result<bool, StreamError> {
        match std::mem::replace(&mut self.state, PlayerState::Idle) {
            PlayerState::Paused(active) => {
                if let Err(e) = active.handle.resume() {
                    self.state = PlayerState::Paused(active);
                    return Err(e);
                }
                info!("▶️ Reproducción reanudada en guild {}", self.guild);
                self.state = PlayerState::Playing(active);
                Ok(true)
            }
            other => {
                self.state = other;
                Ok(false)
            }
        }
    }

    /// Alterna pausa; devuelve el estado resultante
    pub fn toggle_pause(&mut self) -> Result<PlayerStatus, StreamError> {
        match self.status() {
            PlayerStatus::Playing => self.pause()?,
            PlayerStatus::Paused => self.resume()?,
            _ => false,
        };
        Ok(self.status())
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        info!("🔁 Modo de repetición: {:?} en guild {}", mode, self.guild);
    }

    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle = !self.shuffle;
        info!("🔀 Aleatorio {} en guild {}", self.shuffle, self.guild);
        self.shuffle
    }

    pub fn set_volume(&mut self, percent: u32) {
        self.volume = percent;
        if let Some(active) = self.active() {
            if let Err(e) = active.handle.set_gain(volume_to_gain(percent)) {
                warn!("No se pudo aplicar el volumen: {}", e);
            }
        }
        info!("🔊 Volumen ajustado a {}% en guild {}", percent, self.guild);
    }

    /// Cambia un filtro; si está sonando, reconstruye el recurso en la misma posición
    pub async fn set_filter(
        &mut self,
        filter: AudioFilter,
        enabled: bool,
    ) -> Result<bool, AdvanceFailure> {
        if !self.filters.set(filter, enabled) {
            return Ok(false);
        }
        info!("🎛️ Filtro {} = {} en guild {}", filter, enabled, self.guild);

        if self.status() != PlayerStatus::Playing {
            return Ok(true);
        }

        let position = self.position().await.unwrap_or_default();
        let Some(active) = self.take_active() else {
            return Ok(true);
        };
        active.handle.stop();

        match self.tracks.get(&active.key).cloned() {
            Some(entry) => {
                self.start(entry, position).await?;
            }
            None => warn!("La entrada {} desapareció durante el reinicio", active.key),
        }
        Ok(true)
    }

    // Votos de salto

    /// Registra un voto y devuelve el total de votos actuales
    pub fn add_skip_vote(&mut self, user: UserId) -> usize {
        self.skip_voters.insert(user);
        self.skip_voters.len()
    }

    pub fn skip_votes(&self) -> usize {
        self.skip_voters.len()
    }

    pub fn can_skip(&self) -> bool {
        self.skip_guard.can_skip()
    }

    pub fn start_skip(&self) -> Option<SkipPermit> {
        self.skip_guard.start()
    }

    /// Libera el recurso y desconecta; el estado pasa a `Destroyed`
    pub async fn destroy(&mut self) {
        if let Some(active) = self.take_active() {
            active.handle.stop();
        }
        if self.is_destroyed() {
            return;
        }
        self.state = PlayerState::Destroyed;
        self.skip_voters.clear();
        self.connection.disconnect().await;
        info!("⏹️ Cola destruida en guild {}", self.guild);
    }

    pub async fn snapshot(&self, instance: UserId) -> Snapshot {
        let position = self.position().await.unwrap_or_default();

        Snapshot {
            room_id: self.guild,
            bot_instance_id: instance,
            text_channel_id: self.text_channel,
            voice_channel_id: self.voice_channel(),
            songs: self
                .tracks
                .sorted_by_index()
                .into_iter()
                .map(|entry| SnapshotSong {
                    key: entry.key.clone(),
                    index: entry.index,
                    song: entry.track.clone(),
                    requester_id: entry.requester,
                })
                .collect(),
            current_song_key: self.current_key().cloned(),
            current_position: position.as_secs_f64(),
            settings: self.settings(),
            saved_at: chrono::Utc::now(),
        }
    }

    // Funciones privadas

    fn take_active(&mut self) -> Option<ActiveTrack> {
        match std::mem::replace(&mut self.state, PlayerState::Idle) {
            PlayerState::Playing(active) | PlayerState::Paused(active) => Some(active),
            other => {
                self.state = other;
                None
            }
        }
    }

    async fn start(&mut self, entry: QueueEntry, seek: Duration) -> Result<Transition, AdvanceFailure> {
        let failure = |error: StreamError| AdvanceFailure {
            key: entry.key.clone(),
            index: entry.index,
            title: entry.track.title.clone(),
            error,
        };

        let stream = self
            .resolver
            .resolve(&entry.track)
            .await
            .map_err(&failure)?;

        self.generation += 1;
        let request = PlayRequest {
            guild: self.guild,
            generation: self.generation,
            stream,
            seek,
            filters: self.filters.ffmpeg_chain(),
            live: entry.track.is_live(),
        };

        let handle = self.connection.play(request).await.map_err(&failure)?;
        if let Err(e) = handle.set_gain(volume_to_gain(self.volume)) {
            warn!("No se pudo aplicar el volumen inicial: {}", e);
        }

        info!(
            "🎵 Reproduciendo: {} en guild {} (desde {:?})",
            entry.track.title, self.guild, seek
        );
        self.state = PlayerState::Playing(ActiveTrack {
            key: entry.key.clone(),
            index: entry.index,
            generation: self.generation,
            handle,
        });
        Ok(Transition::Playing(entry.key))
    }

    /// Aplica la política de fin de pista y arranca la siguiente
    async fn finish_and_advance(
        &mut self,
        finished: &EntryKey,
        finished_index: u64,
        reason: FinishReason,
    ) -> Result<Transition, AdvanceFailure> {
        self.skip_voters.clear();

        let next = self.next_key(finished, finished_index, reason);
        match next {
            Some(key) => self.advance(Some(key), Duration::ZERO).await,
            None if self.tracks.is_empty() => Ok(Transition::Exhausted),
            None => {
                debug!("Sin siguiente pista en guild {}, queda en espera", self.guild);
                Ok(Transition::Idle)
            }
        }
    }

    fn next_key(&mut self, finished: &EntryKey, finished_index: u64, reason: FinishReason) -> Option<EntryKey> {
        let repeat_song = self.loop_mode == LoopMode::Song && reason != FinishReason::Skipped;

        match self.loop_mode {
            LoopMode::Off => {
                self.tracks.delete(finished);
            }
            LoopMode::Queue => {
                self.tracks.requeue(finished);
            }
            LoopMode::Song => {}
        }

        if self.shuffle && self.loop_mode != LoopMode::Song {
            return self.tracks.random_except(finished).map(|entry| entry.key.clone());
        }

        if repeat_song && self.tracks.contains(finished) {
            return Some(finished.clone());
        }

        self.tracks
            .next_after(finished_index)
            .or_else(|| match self.loop_mode {
                LoopMode::Off => None,
                // Con canción en bucle, saltar también da la vuelta
                LoopMode::Queue | LoopMode::Song => self.tracks.first(),
            })
            .map(|entry| entry.key.clone())
    }
}
