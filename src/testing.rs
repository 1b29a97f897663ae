//! In-memory doubles for the gateway, extractor and snapshot store.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::{HashMap, HashSet},
    io::{self, Cursor},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    audio::track::{EntryKey, Track},
    cache::StreamCache,
    error::{ConnectionError, PersistenceError, StreamError},
    gateway::{
        ChannelKind, Gateway, PlayRequest, PlaybackHandle, SignalSender, VoiceConnection,
    },
    sources::{ExtractOptions, Extraction, Extractor, StreamResolver},
    storage::{PlayerSettings, Snapshot, SnapshotSong, SnapshotStore},
};

// Extractor

pub struct FakeExtractor {
    payload: Vec<u8>,
    fail_exit: bool,
    unavailable: bool,
    calls: AtomicUsize,
    last_options: Mutex<Option<ExtractOptions>>,
}

impl FakeExtractor {
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self {
            payload,
            fail_exit: false,
            unavailable: false,
            calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    /// Entrega `payload` y luego termina con código distinto de cero
    pub fn failing_exit(payload: Vec<u8>) -> Self {
        Self {
            fail_exit: true,
            ..Self::with_payload(payload)
        }
    }

    /// El proceso ni siquiera puede lanzarse
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::with_payload(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ExtractOptions> {
        self.last_options.lock().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, _url: &str, options: &ExtractOptions) -> Result<Extraction, StreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());

        if self.unavailable {
            return Err(StreamError::Spawn {
                program: "fake-extractor".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "not installed"),
            });
        }

        let fail = self.fail_exit;
        Ok(Extraction {
            stdout: Box::new(Cursor::new(self.payload.clone())),
            exit: async move {
                if fail {
                    Err(StreamError::ExitStatus {
                        program: "fake-extractor".to_string(),
                        code: Some(1),
                        stderr: "video unavailable".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            .boxed(),
        })
    }

    async fn probe(&self, query: &str) -> Result<Track, StreamError> {
        if self.unavailable {
            return Err(StreamError::Decode("unavailable".to_string()));
        }
        Ok(Track::new(query, format!("Result for {query}"), format!("https://example.com/{query}"))
            .with_duration(180))
    }
}

/// Resolver con extractor falso y cache en un directorio temporal
pub async fn test_resolver(payload: &[u8]) -> (Arc<StreamResolver>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(StreamCache::open(dir.path(), 1 << 20).await.unwrap());
    let extractor = Arc::new(FakeExtractor::with_payload(payload.to_vec()));
    (
        Arc::new(StreamResolver::new(extractor, cache, ExtractOptions::default())),
        dir,
    )
}

// Voz

/// Recurso reproducido por [`FakeConnection`]
pub struct FakePlayback {
    pub generation: u64,
    pub seek: Duration,
    pub filters: Option<String>,
    pub live: bool,
    paused: AtomicBool,
    stopped: AtomicBool,
    gain: Mutex<f32>,
    position: Mutex<Duration>,
}

impl FakePlayback {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn gain(&self) -> f32 {
        *self.gain.lock()
    }

    pub fn set_position(&self, position: Duration) {
        *self.position.lock() = position;
    }
}

struct FakeHandle(Arc<FakePlayback>);

#[async_trait]
impl PlaybackHandle for FakeHandle {
    fn pause(&self) -> Result<(), StreamError> {
        self.0.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), StreamError> {
        self.0.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
    }

    fn set_gain(&self, gain: f32) -> Result<(), StreamError> {
        *self.0.gain.lock() = gain;
        Ok(())
    }

    async fn position(&self) -> Option<Duration> {
        Some(*self.0.position.lock())
    }
}

pub struct FakeConnection {
    channel: ChannelId,
    plays: Mutex<Vec<Arc<FakePlayback>>>,
    fail_next: AtomicBool,
    disconnected: AtomicBool,
}

impl FakeConnection {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            plays: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn plays(&self) -> Vec<Arc<FakePlayback>> {
        self.plays.lock().clone()
    }

    pub fn last_handle(&self) -> Option<Arc<FakePlayback>> {
        self.plays.lock().last().cloned()
    }

    pub fn fail_next_play(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    async fn play(&self, request: PlayRequest) -> Result<Box<dyn PlaybackHandle>, StreamError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StreamError::Playback("fake refusal".to_string()));
        }

        let playback = Arc::new(FakePlayback {
            generation: request.generation,
            seek: request.seek,
            filters: request.filters,
            live: request.live,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            gain: Mutex::new(1.0),
            position: Mutex::new(request.seek),
        });
        self.plays.lock().push(Arc::clone(&playback));
        Ok(Box::new(FakeHandle(playback)))
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

// Gateway

pub struct FakeGateway {
    instance: UserId,
    channels: Mutex<HashMap<ChannelId, ChannelKind>>,
    occupants: Mutex<HashMap<ChannelId, usize>>,
    members: Mutex<HashSet<UserId>>,
    join_fails: AtomicBool,
    join_delay: Duration,
    joins: AtomicUsize,
    connections: Mutex<HashMap<GuildId, Arc<FakeConnection>>>,
    messages: Mutex<Vec<(ChannelId, String)>>,
}

impl FakeGateway {
    pub fn new(instance: UserId) -> Self {
        Self {
            instance,
            channels: Mutex::new(HashMap::new()),
            occupants: Mutex::new(HashMap::new()),
            members: Mutex::new(HashSet::new()),
            join_fails: AtomicBool::new(false),
            join_delay: Duration::ZERO,
            joins: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_channel(self, channel: ChannelId, kind: ChannelKind) -> Self {
        self.channels.lock().insert(channel, kind);
        self
    }

    pub fn with_occupants(self, channel: ChannelId, humans: usize) -> Self {
        self.occupants.lock().insert(channel, humans);
        self
    }

    pub fn with_member(self, user: UserId) -> Self {
        self.members.lock().insert(user);
        self
    }

    /// Cada unión a voz tarda `delay` antes de completarse
    pub fn with_join_delay(mut self, delay: Duration) -> Self {
        self.join_delay = delay;
        self
    }

    pub fn fail_joins(&self) {
        self.join_fails.store(true, Ordering::SeqCst);
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn connection(&self, guild: GuildId) -> Option<Arc<FakeConnection>> {
        self.connections.lock().get(&guild).cloned()
    }

    pub fn messages(&self) -> Vec<(ChannelId, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    fn instance_id(&self) -> UserId {
        self.instance
    }

    async fn channel_kind(&self, _guild: GuildId, channel: ChannelId) -> Option<ChannelKind> {
        self.channels.lock().get(&channel).copied()
    }

    async fn voice_occupants(&self, _guild: GuildId, channel: ChannelId) -> usize {
        self.occupants.lock().get(&channel).copied().unwrap_or(0)
    }

    async fn resolve_member(&self, _guild: GuildId, user: UserId) -> bool {
        self.members.lock().contains(&user)
    }

    async fn join_voice(
        &self,
        guild: GuildId,
        channel: ChannelId,
        _signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectionError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if !self.join_delay.is_zero() {
            tokio::time::sleep(self.join_delay).await;
        }
        if self.join_fails.load(Ordering::SeqCst) {
            return Err(ConnectionError::Join {
                channel,
                reason: "fake join failure".to_string(),
            });
        }

        let connection = Arc::new(FakeConnection::new(channel));
        self.connections.lock().insert(guild, Arc::clone(&connection));
        Ok(connection)
    }

    async fn send_message(&self, channel: ChannelId, content: String) -> anyhow::Result<()> {
        self.messages.lock().push((channel, content));
        Ok(())
    }
}

// Persistencia

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<(GuildId, UserId), Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn insert(&self, snapshot: Snapshot) {
        self.snapshots
            .lock()
            .insert((snapshot.room_id, snapshot.bot_instance_id), snapshot);
    }

    pub fn contains(&self, room: GuildId, instance: UserId) -> bool {
        self.snapshots.lock().contains_key(&(room, instance))
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, room: GuildId, instance: UserId) -> Result<Option<Snapshot>, PersistenceError> {
        Ok(self.snapshots.lock().get(&(room, instance)).cloned())
    }

    async fn put(&self, room: GuildId, instance: UserId, snapshot: Snapshot) -> Result<(), PersistenceError> {
        self.snapshots.lock().insert((room, instance), snapshot);
        Ok(())
    }

    async fn delete(&self, room: GuildId, instance: UserId) -> Result<(), PersistenceError> {
        self.snapshots.lock().remove(&(room, instance));
        Ok(())
    }

    async fn list(&self, instance: UserId) -> Result<Vec<GuildId>, PersistenceError> {
        let mut rooms: Vec<_> = self
            .snapshots
            .lock()
            .keys()
            .filter(|(_, owner)| *owner == instance)
            .map(|(room, _)| *room)
            .collect();
        rooms.sort();
        Ok(rooms)
    }
}

/// Snapshot con dos pistas; la primera sonaba en el segundo 30
pub fn sample_snapshot(room: GuildId, instance: UserId) -> Snapshot {
    let song = |key: &str, index: u64, requester: u64| SnapshotSong {
        key: EntryKey::from(key),
        index,
        song: Track::new(key, format!("Song {key}"), format!("https://example.com/{key}"))
            .with_thumbnail(format!("https://img.example.com/{key}.jpg"))
            .with_duration(200),
        requester_id: UserId::new(requester),
    };

    Snapshot {
        room_id: room,
        bot_instance_id: instance,
        text_channel_id: ChannelId::new(100),
        voice_channel_id: ChannelId::new(200),
        songs: vec![song("k1", 0, 501), song("k2", 1, 502)],
        current_song_key: Some(EntryKey::from("k1")),
        current_position: 30.0,
        settings: PlayerSettings::default(),
        saved_at: chrono::Utc::now(),
    }
}
