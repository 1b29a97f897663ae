//! Startup restore of persisted queues.
//!
//! Every stored room is restored in its own task so a failure (or panic)
//! in one guild never affects the others. A room is restored only when:
//!
//! 1. no live queue exists for it and no other instance holds its voice
//!    connection (re-checked under the guild's creation lock before joining),
//! 2. its text and voice channels still exist with the expected kinds,
//! 3. at least one human is in the voice channel,
//! 4. at least one entry's requester can still be resolved.
//!
//! Playback resumes from the persisted current entry when it survived,
//! otherwise from the lowest index, seeking only when the stored
//! position lies inside the track.

use futures::future::join_all;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{manager::QueueManager, player::RoomQueue, track::EntryKey},
    error::RestoreError,
    gateway::ChannelKind,
};

/// Resumen de un arranque
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Resultado de restaurar un guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { start: EntryKey, offset: Duration },
    NothingStored,
}

pub async fn restore_all(manager: Arc<QueueManager>) -> RestoreReport {
    let rooms = match manager.persistence().stored_rooms().await {
        Ok(rooms) => rooms,
        Err(e) => {
            error!("❌ No se pudieron listar los snapshots: {}", e);
            return RestoreReport::default();
        }
    };

    if rooms.is_empty() {
        debug!("Sin colas que restaurar para instancia {}", manager.instance());
        return RestoreReport::default();
    }
    info!("🔄 Restaurando {} colas para instancia {}", rooms.len(), manager.instance());

    let tasks = rooms.into_iter().map(|room| {
        let manager = Arc::clone(&manager);
        let task = tokio::spawn(async move { restore_room(&manager, room).await });
        async move { (room, task.await) }
    });

    let mut report = RestoreReport::default();
    for (room, result) in join_all(tasks).await {
        match result {
            Ok(Ok(RestoreOutcome::Restored { start, offset })) => {
                info!("✅ Guild {} restaurado en {} (desde {:?})", room, start, offset);
                report.restored += 1;
            }
            Ok(Ok(RestoreOutcome::NothingStored)) => report.skipped += 1,
            Ok(Err(e @ (RestoreError::AlreadyActive(_) | RestoreError::NotOwner(_)))) => {
                debug!("Guild {} omitido: {}", room, e);
                report.skipped += 1;
            }
            Ok(Err(e)) => {
                warn!("⚠️ No se restauró guild {}: {}", room, e);
                report.failed += 1;
            }
            Err(e) => {
                error!("💥 La restauración de guild {} abortó: {}", room, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "🔄 Restauración terminada: {} restauradas, {} omitidas, {} fallidas",
        report.restored, report.skipped, report.failed
    );
    report
}

pub async fn restore_room(manager: &QueueManager, room: GuildId) -> Result<RestoreOutcome, RestoreError> {
    let result = try_restore(manager, room).await;
    if let Err(e) = &result {
        if !e.keeps_snapshot() {
            manager.persistence().delete(room);
        }
    }
    result
}

async fn try_restore(manager: &QueueManager, room: GuildId) -> Result<RestoreOutcome, RestoreError> {
    let instance = manager.instance();
    if manager.has_room(room) {
        return Err(RestoreError::AlreadyActive(room));
    }
    if let Some(owner) = manager.federation().connection_owner(room) {
        if owner != instance {
            return Err(RestoreError::NotOwner(room));
        }
    }

    let Some(snapshot) = manager.persistence().load(room).await? else {
        return Ok(RestoreOutcome::NothingStored);
    };

    let gateway = manager.gateway();
    let text = snapshot.text_channel_id;
    let voice = snapshot.voice_channel_id;

    if gateway.channel_kind(room, text).await != Some(ChannelKind::Text) {
        return Err(RestoreError::InvalidChannel(text));
    }
    if gateway.channel_kind(room, voice).await != Some(ChannelKind::Voice) {
        return Err(RestoreError::InvalidChannel(voice));
    }
    if gateway.voice_occupants(room, voice).await == 0 {
        return Err(RestoreError::EmptyVoiceRoom(voice));
    }

    let mut songs = Vec::with_capacity(snapshot.songs.len());
    for song in &snapshot.songs {
        if gateway.resolve_member(room, song.requester_id).await {
            songs.push(song.clone());
        } else {
            debug!("Solicitante {} ya no está en guild {}", song.requester_id, room);
        }
    }
    if songs.is_empty() {
        return Err(RestoreError::NoResolvableTracks);
    }

    // Un comando pudo crear la cola mientras se validaba el snapshot
    let creating = manager.creation_lock(room).await;
    if manager.has_room(room) {
        return Err(RestoreError::AlreadyActive(room));
    }

    let connection = match gateway.join_voice(room, voice, manager.signal_sender()).await {
        Ok(connection) => connection,
        Err(e) => {
            manager
                .notify(text, format!("❌ No pude volver al canal de voz para restaurar la cola: {e}"))
                .await;
            return Err(e.into());
        }
    };

    let mut queue = RoomQueue::new(
        room,
        text,
        connection,
        Arc::clone(manager.resolver()),
        snapshot.settings.clone(),
    );
    for song in songs {
        let key = song.key.clone();
        if !queue
            .tracks_mut()
            .restore(song.key, song.index, song.song, song.requester_id)
        {
            warn!("Entrada {} del snapshot de guild {} descartada", key, room);
        }
    }

    let start = snapshot
        .current_song_key
        .clone()
        .filter(|key| queue.tracks().contains(key))
        .or_else(|| queue.tracks().first().map(|entry| entry.key.clone()));
    let Some(start) = start else {
        return Err(RestoreError::NoResolvableTracks);
    };

    let duration = queue
        .tracks()
        .get(&start)
        .map(|entry| entry.track.duration)
        .unwrap_or(0);
    let offset = snapshot.resume_offset(&start, duration);
    if offset.is_zero()
        && snapshot.current_song_key.as_ref() == Some(&start)
        && snapshot.current_position > 0.0
    {
        warn!(
            "Posición {}s inválida para {} en guild {}, se empieza desde 0",
            snapshot.current_position, start, room
        );
    }

    let mut queue = manager.install_locked(queue).await;
    drop(creating);
    let result = queue.advance(Some(start.clone()), offset).await;
    manager.settle(&mut queue, result).await;
    if !queue.is_destroyed() {
        manager.persistence().save(queue.snapshot(instance).await);
    }

    Ok(RestoreOutcome::Restored { start, offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            manager::{EnqueueRequest, ManagerSettings},
            player::PlayerStatus,
            track::Track,
        },
        coordinator::Federation,
        storage::{Persistence, SnapshotStore},
        testing::{sample_snapshot, test_resolver, FakeGateway, MemorySnapshotStore},
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, UserId};

    const BOT: UserId = UserId::new(900);
    const ROOM: GuildId = GuildId::new(1);
    const TEXT: ChannelId = ChannelId::new(100);
    const VOICE: ChannelId = ChannelId::new(200);

    struct Harness {
        manager: Arc<QueueManager>,
        gateway: Arc<FakeGateway>,
        store: Arc<MemorySnapshotStore>,
        _dir: tempfile::TempDir,
    }

    fn valid_gateway() -> FakeGateway {
        FakeGateway::new(BOT)
            .with_channel(TEXT, ChannelKind::Text)
            .with_channel(VOICE, ChannelKind::Voice)
            .with_occupants(VOICE, 2)
            .with_member(UserId::new(501))
            .with_member(UserId::new(502))
    }

    async fn harness(gateway: FakeGateway) -> Harness {
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemorySnapshotStore::default());
        store.insert(sample_snapshot(ROOM, BOT));
        let (resolver, dir) = test_resolver(b"audio").await;
        let (manager, _signals) = QueueManager::new(
            gateway.clone(),
            resolver,
            Persistence::spawn(store.clone(), BOT),
            Arc::new(Federation::new()),
            ManagerSettings::default(),
        );
        Harness {
            manager,
            gateway,
            store,
            _dir: dir,
        }
    }

    fn command(id: &str) -> EnqueueRequest {
        EnqueueRequest {
            guild: ROOM,
            text_channel: TEXT,
            voice_channel: VOICE,
            track: Track::new(id, format!("Song {id}"), format!("https://example.com/{id}"))
                .with_duration(120),
            requester: UserId::new(501),
        }
    }

    #[tokio::test]
    async fn restores_queue_at_persisted_position() {
        let h = harness(valid_gateway()).await;

        let outcome = restore_room(&h.manager, ROOM).await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                start: EntryKey::from("k1"),
                offset: Duration::from_secs(30),
            }
        );

        let plays = h.gateway.connection(ROOM).unwrap().plays();
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].seek, Duration::from_secs(30));

        let view = h.manager.queue_view(ROOM).await.unwrap();
        assert_eq!(view.status, PlayerStatus::Playing);
        assert_eq!(view.now_playing.unwrap().key, EntryKey::from("k1"));
        assert_eq!(view.upcoming.len(), 1);
    }

    #[tokio::test]
    async fn restored_queue_matches_what_was_saved() {
        let h = harness(valid_gateway()).await;
        restore_room(&h.manager, ROOM).await.unwrap();
        h.manager.persistence().flush().await;

        let original = sample_snapshot(ROOM, BOT);
        let saved = h.store.get(ROOM, BOT).await.unwrap().unwrap();
        assert_eq!(saved.songs, original.songs);
        assert_eq!(saved.current_song_key, original.current_song_key);
        assert_eq!(saved.settings, original.settings);
    }

    #[tokio::test]
    async fn empty_voice_channel_is_not_rejoined() {
        let h = harness(valid_gateway().with_occupants(VOICE, 0)).await;

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::EmptyVoiceRoom(VOICE))));
        assert_eq!(h.gateway.joins(), 0);
        assert!(!h.manager.has_room(ROOM));

        h.manager.persistence().flush().await;
        assert!(h.store.contains(ROOM, BOT));
    }

    #[tokio::test]
    async fn no_resolvable_requesters_deletes_the_snapshot() {
        let gateway = FakeGateway::new(BOT)
            .with_channel(TEXT, ChannelKind::Text)
            .with_channel(VOICE, ChannelKind::Voice)
            .with_occupants(VOICE, 2);
        let h = harness(gateway).await;

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::NoResolvableTracks)));
        assert_eq!(h.gateway.joins(), 0);

        h.manager.persistence().flush().await;
        assert!(!h.store.contains(ROOM, BOT));
    }

    #[tokio::test]
    async fn unresolvable_entries_are_dropped() {
        let gateway = FakeGateway::new(BOT)
            .with_channel(TEXT, ChannelKind::Text)
            .with_channel(VOICE, ChannelKind::Voice)
            .with_occupants(VOICE, 1)
            .with_member(UserId::new(502));
        let h = harness(gateway).await;

        let outcome = restore_room(&h.manager, ROOM).await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Restored {
                start: EntryKey::from("k2"),
                offset: Duration::ZERO,
            }
        );
        assert_eq!(h.manager.queue_view(ROOM).await.unwrap().upcoming.len(), 0);
    }

    #[tokio::test]
    async fn wrong_channel_kinds_abort_the_restore() {
        let gateway = valid_gateway().with_channel(VOICE, ChannelKind::Text);
        let h = harness(gateway).await;

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::InvalidChannel(VOICE))));
        assert_eq!(h.gateway.joins(), 0);
    }

    #[tokio::test]
    async fn offset_at_track_end_starts_from_zero() {
        let h = harness(valid_gateway()).await;
        let mut snapshot = sample_snapshot(ROOM, BOT);
        snapshot.current_position = 200.0;
        h.store.insert(snapshot);

        restore_room(&h.manager, ROOM).await.unwrap();
        let plays = h.gateway.connection(ROOM).unwrap().plays();
        assert_eq!(plays[0].seek, Duration::ZERO);
    }

    #[tokio::test]
    async fn offset_just_inside_the_track_is_honored() {
        let h = harness(valid_gateway()).await;
        let mut snapshot = sample_snapshot(ROOM, BOT);
        snapshot.current_position = 199.5;
        h.store.insert(snapshot);

        restore_room(&h.manager, ROOM).await.unwrap();
        let plays = h.gateway.connection(ROOM).unwrap().plays();
        assert_eq!(plays[0].seek, Duration::from_secs_f64(199.5));
    }

    #[tokio::test]
    async fn rooms_owned_elsewhere_are_skipped() {
        let h = harness(valid_gateway()).await;
        h.manager.federation().record_connection(ROOM, UserId::new(901));

        let report = restore_all(Arc::clone(&h.manager)).await;
        assert_eq!(
            report,
            RestoreReport {
                restored: 0,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(h.gateway.joins(), 0);
    }

    #[tokio::test]
    async fn live_rooms_are_not_restored_twice() {
        let h = harness(valid_gateway()).await;
        restore_room(&h.manager, ROOM).await.unwrap();

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::AlreadyActive(ROOM))));
        assert_eq!(h.gateway.joins(), 1);
    }

    #[tokio::test]
    async fn restore_all_reports_each_room() {
        let h = harness(valid_gateway()).await;
        // Un segundo guild cuyo canal de voz ya no existe
        let mut broken = sample_snapshot(GuildId::new(2), BOT);
        broken.voice_channel_id = ChannelId::new(999);
        h.store.insert(broken);

        let report = restore_all(Arc::clone(&h.manager)).await;
        assert_eq!(
            report,
            RestoreReport {
                restored: 1,
                skipped: 0,
                failed: 1
            }
        );
        assert!(h.manager.has_room(ROOM));
        assert!(!h.manager.has_room(GuildId::new(2)));
    }

    #[tokio::test]
    async fn restore_yields_to_a_room_created_while_joining() {
        let h = harness(valid_gateway().with_join_delay(Duration::from_millis(50))).await;

        let manager = Arc::clone(&h.manager);
        let enqueue = tokio::spawn(async move { manager.enqueue(command("cmd")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::AlreadyActive(ROOM))));
        assert!(enqueue.await.unwrap().unwrap().started);

        assert_eq!(h.gateway.joins(), 1);
        let view = h.manager.queue_view(ROOM).await.unwrap();
        assert_eq!(view.now_playing.unwrap().track.id, "cmd");
        assert!(view.upcoming.is_empty());
    }

    #[tokio::test]
    async fn commands_during_restore_land_in_the_restored_room() {
        let h = harness(valid_gateway().with_join_delay(Duration::from_millis(50))).await;

        let manager = Arc::clone(&h.manager);
        let restore = tokio::spawn(async move { restore_room(&manager, ROOM).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = h.manager.enqueue(command("cmd")).await.unwrap();
        assert!(!outcome.started);
        assert_eq!(outcome.position, 3);
        assert!(restore.await.unwrap().is_ok());

        assert_eq!(h.gateway.joins(), 1);
        let view = h.manager.queue_view(ROOM).await.unwrap();
        assert_eq!(view.now_playing.unwrap().key, EntryKey::from("k1"));
        assert_eq!(view.upcoming.len(), 2);
    }

    #[tokio::test]
    async fn join_failures_are_reported_in_the_text_channel() {
        let h = harness(valid_gateway()).await;
        h.gateway.fail_joins();

        let result = restore_room(&h.manager, ROOM).await;
        assert!(matches!(result, Err(RestoreError::Connection(_))));
        assert!(!h.manager.has_room(ROOM));

        let messages = h.gateway.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, TEXT);

        h.manager.persistence().flush().await;
        assert!(h.store.contains(ROOM, BOT));
    }
}
