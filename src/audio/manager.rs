use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::{
    effects::AudioFilter,
    player::{AdvanceFailure, LoopMode, PlayerStatus, RoomQueue, SkipGuard, Transition},
    track::{EntryKey, QueueEntry, Track},
};
use crate::{
    coordinator::Federation,
    error::QueueError,
    gateway::{Gateway, RoomSignal, SignalReceiver},
    scheduler::TaskScheduler,
    sources::StreamResolver,
    storage::{Persistence, PlayerSettings},
};

/// Límites del gestor de colas
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_queue_size: usize,
    pub default_volume: u32,
    /// Tiempo con el canal vacío antes de desconectar
    pub idle_timeout: Duration,
    pub max_consecutive_failures: u8,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_volume: 100,
            idle_timeout: Duration::from_secs(300),
            max_consecutive_failures: 3,
        }
    }
}

/// Cola de un guild registrada en el gestor
#[derive(Clone)]
pub struct RoomSlot {
    pub queue: Arc<Mutex<RoomQueue>>,
    pub guild: GuildId,
    pub text_channel: ChannelId,
    pub voice_channel: ChannelId,
    skip: SkipGuard,
}

impl RoomSlot {
    fn new(queue: RoomQueue) -> Self {
        Self {
            guild: queue.guild(),
            text_channel: queue.text_channel(),
            voice_channel: queue.voice_channel(),
            skip: queue.skip_guard(),
            queue: Arc::new(Mutex::new(queue)),
        }
    }
}

pub struct EnqueueRequest {
    pub guild: GuildId,
    pub text_channel: ChannelId,
    pub voice_channel: ChannelId,
    pub track: Track,
    pub requester: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub key: EntryKey,
    /// Posición 1-based dentro de la cola
    pub position: usize,
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipOutcome {
    pub skipped: Option<String>,
    pub now_playing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    pub votes: usize,
    pub needed: usize,
    pub skipped: Option<SkipOutcome>,
}

/// Estado de la cola para mostrar al usuario
#[derive(Debug, Clone)]
pub struct QueueView {
    pub status: PlayerStatus,
    pub now_playing: Option<QueueEntry>,
    pub position: Option<Duration>,
    pub upcoming: Vec<QueueEntry>,
    pub loop_mode: LoopMode,
    pub shuffle: bool,
    pub volume: u32,
    pub filters: Vec<AudioFilter>,
    pub total_duration: u64,
}

/// Votos necesarios para saltar con `listeners` oyentes humanos
pub fn votes_needed(listeners: usize) -> usize {
    listeners.div_ceil(2).max(1)
}

/// Registro de colas activas de una identidad del bot
pub struct QueueManager {
    gateway: Arc<dyn Gateway>,
    resolver: Arc<StreamResolver>,
    persistence: Persistence,
    federation: Arc<Federation>,
    rooms: DashMap<GuildId, RoomSlot>,
    /// Serializa la creación de la cola de cada guild (comandos y restauración)
    creating: DashMap<GuildId, Arc<Mutex<()>>>,
    signals: crate::gateway::SignalSender,
    idle: TaskScheduler<GuildId>,
    settings: ManagerSettings,
}

impl QueueManager {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        resolver: Arc<StreamResolver>,
        persistence: Persistence,
        federation: Arc<Federation>,
        settings: ManagerSettings,
    ) -> (Arc<Self>, SignalReceiver) {
        let (signals, receiver) = tokio::sync::mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            gateway,
            resolver,
            persistence,
            federation,
            rooms: DashMap::new(),
            creating: DashMap::new(),
            signals,
            idle: TaskScheduler::new(),
            settings,
        });
        (manager, receiver)
    }

    pub fn instance(&self) -> UserId {
        self.gateway.instance_id()
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn resolver(&self) -> &Arc<StreamResolver> {
        &self.resolver
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn federation(&self) -> &Arc<Federation> {
        &self.federation
    }

    pub fn signal_sender(&self) -> crate::gateway::SignalSender {
        self.signals.clone()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn slot(&self, guild: GuildId) -> Option<RoomSlot> {
        self.rooms.get(&guild).map(|slot| slot.clone())
    }

    pub fn has_room(&self, guild: GuildId) -> bool {
        self.rooms.contains_key(&guild)
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Bloqueo de creación del guild; quien lo tiene puede unirse a voz e instalar
    pub async fn creation_lock(&self, guild: GuildId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.creating.entry(guild).or_default().value());
        lock.lock_owned().await
    }

    /// Registra una cola ya conectada
    pub fn install(&self, queue: RoomQueue) -> RoomSlot {
        let slot = RoomSlot::new(queue);
        self.register(slot.clone());
        slot
    }

    /// Como [`Self::install`], pero la cola ya está bloqueada cuando se vuelve visible
    pub async fn install_locked(&self, queue: RoomQueue) -> OwnedMutexGuard<RoomQueue> {
        let slot = RoomSlot::new(queue);
        let guard = Arc::clone(&slot.queue).lock_owned().await;
        self.register(slot);
        guard
    }

    fn register(&self, slot: RoomSlot) {
        let guild = slot.guild;
        self.rooms.insert(guild, slot);
        self.federation.record_connection(guild, self.instance());
        debug!("Cola registrada para guild {}", guild);
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, QueueError> {
        let guild = request.guild;
        let slot = match self.slot(guild) {
            Some(slot) => slot,
            None => {
                self.open_room(guild, request.text_channel, request.voice_channel)
                    .await?
            }
        };
        self.idle.cancel(&guild);

        let mut queue = slot.queue.lock().await;
        if queue.is_destroyed() {
            return Err(QueueError::Destroyed);
        }
        if queue.tracks().len() >= self.settings.max_queue_size {
            return Err(QueueError::QueueFull(self.settings.max_queue_size));
        }

        info!("➕ {} añadida a la cola de guild {}", request.track.title, guild);
        let key = queue.add(request.track, request.requester);
        let position = queue.tracks().len();

        let started = queue.status() == PlayerStatus::Idle;
        if started {
            let result = queue.advance(None, Duration::ZERO).await;
            self.settle(&mut queue, result).await;
        }
        self.persist(&queue).await;

        Ok(EnqueueOutcome {
            key,
            position,
            started,
        })
    }

    pub async fn skip(&self, guild: GuildId) -> Result<SkipOutcome, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        // El guard se consulta antes de esperar el lock de la cola
        let _permit = slot.skip.start().ok_or(QueueError::SkipInProgress)?;

        let mut queue = slot.queue.lock().await;
        if queue.is_destroyed() {
            return Err(QueueError::Destroyed);
        }

        let skipped = queue.current_entry().map(|entry| entry.track.title.clone());
        let result = queue.skip().await;
        let transition = self.settle(&mut queue, result).await;
        self.persist(&queue).await;

        Ok(SkipOutcome {
            skipped,
            now_playing: now_playing_title(&queue, &transition),
        })
    }

    /// Registra un voto; salta cuando vota la mitad de los oyentes
    pub async fn vote_skip(&self, guild: GuildId, voter: UserId) -> Result<VoteOutcome, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let listeners = self
            .gateway
            .voice_occupants(guild, slot.voice_channel)
            .await;
        let needed = votes_needed(listeners);

        let votes = {
            let mut queue = slot.queue.lock().await;
            if queue.current_key().is_none() {
                return Err(QueueError::NoQueue);
            }
            queue.add_skip_vote(voter)
        };
        info!("🗳️ Voto de salto {}/{} en guild {}", votes, needed, guild);

        let skipped = if votes >= needed {
            Some(self.skip(guild).await?)
        } else {
            None
        };

        Ok(VoteOutcome {
            votes,
            needed,
            skipped,
        })
    }

    pub async fn stop(&self, guild: GuildId) -> Result<(), QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        self.teardown(&mut queue, None).await;
        Ok(())
    }

    pub async fn pause(&self, guild: GuildId) -> Result<bool, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        let changed = queue.pause()?;
        self.persist(&queue).await;
        Ok(changed)
    }

    pub async fn resume(&self, guild: GuildId) -> Result<bool, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        let changed = queue.resume()?;
        self.persist(&queue).await;
        Ok(changed)
    }

    pub async fn toggle_pause(&self, guild: GuildId) -> Result<PlayerStatus, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        let status = queue.toggle_pause()?;
        self.persist(&queue).await;
        Ok(status)
    }

    pub async fn set_loop_mode(&self, guild: GuildId, mode: LoopMode) -> Result<(), QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        queue.set_loop_mode(mode);
        self.persist(&queue).await;
        Ok(())
    }

    pub async fn toggle_shuffle(&self, guild: GuildId) -> Result<bool, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        let enabled = queue.toggle_shuffle();
        self.persist(&queue).await;
        Ok(enabled)
    }

    pub async fn set_volume(&self, guild: GuildId, percent: u32) -> Result<(), QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;
        queue.set_volume(percent);
        self.persist(&queue).await;
        Ok(())
    }

    pub async fn set_filter(
        &self,
        guild: GuildId,
        filter: AudioFilter,
        enabled: bool,
    ) -> Result<bool, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;

        let changed = match queue.set_filter(filter, enabled).await {
            Ok(changed) => changed,
            Err(failure) => {
                self.settle(&mut queue, Err(failure)).await;
                true
            }
        };
        self.persist(&queue).await;
        Ok(changed)
    }

    /// Quita una entrada; si es la actual se salta a la siguiente
    pub async fn remove(&self, guild: GuildId, key: &EntryKey) -> Result<QueueEntry, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let mut queue = slot.queue.lock().await;

        let was_current = queue.is_current(key);
        let removed = queue.remove(key).ok_or(QueueError::UnknownEntry)?;
        info!("➖ {} quitada de la cola de guild {}", removed.track.title, guild);

        if was_current {
            let result = queue.skip().await;
            self.settle(&mut queue, result).await;
        } else if queue.tracks().is_empty() {
            self.teardown(&mut queue, None).await;
        }
        self.persist(&queue).await;
        Ok(removed)
    }

    pub async fn queue_view(&self, guild: GuildId) -> Result<QueueView, QueueError> {
        let slot = self.slot(guild).ok_or(QueueError::NoQueue)?;
        let queue = slot.queue.lock().await;
        let current = queue.current_key().cloned();

        Ok(QueueView {
            status: queue.status(),
            now_playing: queue.current_entry().cloned(),
            position: queue.position().await,
            upcoming: queue
                .tracks()
                .sorted_by_index()
                .into_iter()
                .filter(|entry| Some(&entry.key) != current.as_ref())
                .cloned()
                .collect(),
            loop_mode: queue.loop_mode(),
            shuffle: queue.shuffle(),
            volume: queue.volume(),
            filters: queue.filters().iter().collect(),
            total_duration: queue.tracks().total_duration(),
        })
    }

    /// Procesa las notificaciones del reproductor hasta que se cierre el canal
    pub async fn run_signals(self: Arc<Self>, mut receiver: SignalReceiver) {
        while let Some(signal) = receiver.recv().await {
            self.handle_signal(signal).await;
        }
        debug!("Bucle de señales terminado para instancia {}", self.instance());
    }

    pub async fn handle_signal(&self, signal: RoomSignal) {
        match signal {
            RoomSignal::TrackEnded { guild, generation } => {
                let Some(slot) = self.slot(guild) else { return };
                let mut queue = slot.queue.lock().await;
                if let Some(result) = queue.handle_track_end(generation).await {
                    self.settle(&mut queue, result).await;
                    self.persist(&queue).await;
                }
            }
            RoomSignal::TrackFailed {
                guild,
                generation,
                reason,
            } => {
                let Some(slot) = self.slot(guild) else { return };
                let mut queue = slot.queue.lock().await;
                if let Some(failure) = queue.handle_track_error(generation, reason) {
                    self.settle(&mut queue, Err(failure)).await;
                    self.persist(&queue).await;
                }
            }
            RoomSignal::ConnectionLost { guild, channel } => {
                let Some(slot) = self.slot(guild) else { return };
                if slot.voice_channel != channel {
                    debug!(
                        "Desconexión de {} ignorada; la cola de guild {} está en {}",
                        channel, guild, slot.voice_channel
                    );
                    return;
                }
                let mut queue = slot.queue.lock().await;
                warn!("🔌 Conexión de voz perdida en guild {}", guild);
                self.teardown(&mut queue, Some("🔌 Se perdió la conexión de voz, cola detenida"))
                    .await;
            }
        }
    }

    /// Ajusta el temporizador de inactividad según los oyentes del canal
    pub fn on_listeners_changed(self: &Arc<Self>, guild: GuildId, listeners: usize) {
        if !self.has_room(guild) {
            return;
        }

        if listeners > 0 {
            if self.idle.cancel(&guild) {
                debug!("Temporizador de inactividad cancelado en guild {}", guild);
            }
            return;
        }

        if self.idle.is_scheduled(&guild) {
            return;
        }

        info!(
            "⏳ Canal vacío en guild {}, desconexión en {:?}",
            guild, self.settings.idle_timeout
        );
        let manager = Arc::clone(self);
        self.idle.schedule(guild, self.settings.idle_timeout, async move {
            manager.destroy_idle(guild).await;
        });
    }

    /// Guarda un snapshot de cada cola que esté sonando
    pub async fn snapshot_playing(&self) {
        for slot in self.slots() {
            let queue = slot.queue.lock().await;
            if queue.status() == PlayerStatus::Playing {
                self.persist(&queue).await;
            }
        }
    }

    pub fn spawn_snapshot_task(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.snapshot_playing().await;
            }
        })
    }

    /// Persiste todas las colas y espera a que las escrituras terminen
    pub async fn shutdown(&self) {
        self.idle.cancel_all();
        for slot in self.slots() {
            let queue = slot.queue.lock().await;
            self.persist(&queue).await;
        }
        self.persistence.flush().await;
        info!("💾 {} colas guardadas para instancia {}", self.rooms.len(), self.instance());
    }

    // Funciones privadas

    fn slots(&self) -> Vec<RoomSlot> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn open_room(
        &self,
        guild: GuildId,
        text_channel: ChannelId,
        voice_channel: ChannelId,
    ) -> Result<RoomSlot, QueueError> {
        let _creating = self.creation_lock(guild).await;
        if let Some(slot) = self.slot(guild) {
            return Ok(slot);
        }

        let connection = match self
            .gateway
            .join_voice(guild, voice_channel, self.signals.clone())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                error!("❌ No se pudo conectar a voz en guild {}: {}", guild, e);
                self.notify(text_channel, format!("❌ No pude unirme al canal de voz: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        let queue = RoomQueue::new(
            guild,
            text_channel,
            connection,
            Arc::clone(&self.resolver),
            PlayerSettings {
                volume: self.settings.default_volume,
                ..PlayerSettings::default()
            },
        );
        Ok(self.install(queue))
    }

    /// Resuelve la transición, saltando pistas que fallan hasta el límite
    pub(crate) async fn settle(
        &self,
        queue: &mut RoomQueue,
        mut result: Result<Transition, AdvanceFailure>,
    ) -> Transition {
        loop {
            match result {
                Ok(Transition::Playing(key)) => {
                    if let Some(entry) = queue.tracks().get(&key) {
                        let message = format!(
                            "🎵 Reproduciendo: **{}** [{}]",
                            entry.track.title,
                            entry.track.display_duration()
                        );
                        self.notify(queue.text_channel(), message).await;
                    }
                    return Transition::Playing(key);
                }
                Ok(Transition::Idle) => return Transition::Idle,
                Ok(Transition::Exhausted) => {
                    self.teardown(queue, Some("✅ Cola terminada")).await;
                    return Transition::Exhausted;
                }
                Err(failure) => {
                    warn!(
                        "❌ Fallo reproduciendo {} en guild {}: {}",
                        failure.title,
                        queue.guild(),
                        failure.error
                    );
                    self.notify(
                        queue.text_channel(),
                        format!("❌ No se pudo reproducir **{}**", failure.title),
                    )
                    .await;

                    let failures = queue.record_failure();
                    if failures >= self.settings.max_consecutive_failures {
                        error!(
                            "Demasiados fallos seguidos ({}) en guild {}",
                            failures,
                            queue.guild()
                        );
                        self.teardown(
                            queue,
                            Some("⚠️ Demasiados errores seguidos, se detiene la reproducción"),
                        )
                        .await;
                        return Transition::Exhausted;
                    }
                    result = queue.recover_from_failure(&failure).await;
                }
            }
        }
    }

    async fn destroy_idle(&self, guild: GuildId) {
        let Some(slot) = self.slot(guild) else { return };
        let mut queue = slot.queue.lock().await;
        info!("👋 Guild {} inactivo, desconectando", guild);
        self.teardown(&mut queue, Some("👋 Canal vacío, me desconecto")).await;
    }

    async fn teardown(&self, queue: &mut RoomQueue, notice: Option<&str>) {
        if queue.is_destroyed() {
            return;
        }
        let guild = queue.guild();
        queue.destroy().await;

        self.rooms.remove(&guild);
        self.idle.cancel(&guild);
        self.federation.release_connection(guild, self.instance());
        self.persistence.delete(guild);

        if let Some(notice) = notice {
            self.notify(queue.text_channel(), notice.to_string()).await;
        }
    }

    async fn persist(&self, queue: &RoomQueue) {
        if queue.is_destroyed() {
            return;
        }
        self.persistence.save(queue.snapshot(self.instance()).await);
    }

    pub(crate) async fn notify(&self, channel: ChannelId, content: String) {
        if let Err(e) = self.gateway.send_message(channel, content).await {
            warn!("No se pudo enviar mensaje a {}: {}", channel, e);
        }
    }
}

fn now_playing_title(queue: &RoomQueue, transition: &Transition) -> Option<String> {
    match transition {
        Transition::Playing(key) => queue.tracks().get(key).map(|entry| entry.track.title.clone()),
        _ => None,
    }
}
