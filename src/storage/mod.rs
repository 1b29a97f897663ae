//! # Storage Module
//!
//! Snapshot persistence for per-guild queues.
//!
//! - [`snapshot`]: the persisted schema
//! - [`json`]: one JSON file per (guild, bot instance), the default store
//! - [`restore`]: the startup protocol that replays snapshots into queues
//!
//! Writes are fire-and-forget. [`Persistence`] funnels every save and
//! delete for one bot identity through a single writer task, so writes for
//! a guild land in the order they were issued and a failing store is only
//! ever logged.

pub mod json;
pub mod restore;
pub mod snapshot;

use async_trait::async_trait;
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::PersistenceError;

pub use json::JsonSnapshotStore;
pub use snapshot::{PlayerSettings, Snapshot, SnapshotSong};

/// Almacén clave-valor de snapshots por (guild, instancia)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, room: GuildId, instance: UserId) -> Result<Option<Snapshot>, PersistenceError>;

    async fn put(&self, room: GuildId, instance: UserId, snapshot: Snapshot) -> Result<(), PersistenceError>;

    async fn delete(&self, room: GuildId, instance: UserId) -> Result<(), PersistenceError>;

    /// Guilds con snapshot guardado para una instancia
    async fn list(&self, instance: UserId) -> Result<Vec<GuildId>, PersistenceError>;
}

enum PersistCommand {
    Save(Snapshot),
    Delete(GuildId),
    Flush(oneshot::Sender<()>),
}

/// Escritor ordenado de snapshots para una identidad del bot
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn SnapshotStore>,
    instance: UserId,
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persistence {
    pub fn spawn(store: Arc<dyn SnapshotStore>, instance: UserId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(Arc::clone(&store), instance, rx));
        Self { store, instance, tx }
    }

    pub fn instance(&self) -> UserId {
        self.instance
    }

    /// Encola un guardado; los errores sólo se registran
    pub fn save(&self, snapshot: Snapshot) {
        if self.tx.send(PersistCommand::Save(snapshot)).is_err() {
            warn!("💾 Escritor de snapshots detenido, guardado descartado");
        }
    }

    pub fn delete(&self, room: GuildId) {
        if self.tx.send(PersistCommand::Delete(room)).is_err() {
            warn!("💾 Escritor de snapshots detenido, borrado descartado");
        }
    }

    /// Espera a que todas las escrituras encoladas hasta ahora terminen
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub async fn load(&self, room: GuildId) -> Result<Option<Snapshot>, PersistenceError> {
        self.store.get(room, self.instance).await
    }

    pub async fn stored_rooms(&self) -> Result<Vec<GuildId>, PersistenceError> {
        self.store.list(self.instance).await
    }
}

async fn writer_loop(
    store: Arc<dyn SnapshotStore>,
    instance: UserId,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Save(snapshot) => {
                let room = snapshot.room_id;
                match store.put(room, instance, snapshot).await {
                    Ok(()) => debug!("💾 Snapshot guardado para guild {}", room),
                    Err(e) => warn!("💾 No se pudo guardar el snapshot de guild {}: {}", room, e),
                }
            }
            PersistCommand::Delete(room) => match store.delete(room, instance).await {
                Ok(()) => debug!("🗑️ Snapshot eliminado para guild {}", room),
                Err(e) => warn!("💾 No se pudo borrar el snapshot de guild {}: {}", room, e),
            },
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Escritor de snapshots terminado para instancia {}", instance);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_snapshot, MemorySnapshotStore};

    #[tokio::test]
    async fn writes_are_applied_in_order() {
        let store = Arc::new(MemorySnapshotStore::default());
        let persistence = Persistence::spawn(store.clone(), UserId::new(9));

        let mut snapshot = sample_snapshot(GuildId::new(1), UserId::new(9));
        persistence.save(snapshot.clone());
        snapshot.current_position = 30.0;
        persistence.save(snapshot.clone());
        persistence.flush().await;

        let stored = persistence.load(GuildId::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.current_position, 30.0);

        persistence.save(snapshot);
        persistence.delete(GuildId::new(1));
        persistence.flush().await;
        assert!(persistence.load(GuildId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _| Err(PersistenceError::WorkerGone));
        store.expect_delete().times(1).returning(|_, _| Ok(()));

        let persistence = Persistence::spawn(Arc::new(store), UserId::new(9));
        persistence.save(sample_snapshot(GuildId::new(1), UserId::new(9)));
        persistence.delete(GuildId::new(1));
        // El escritor sigue vivo tras el fallo
        persistence.flush().await;
    }
}
