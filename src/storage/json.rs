use async_trait::async_trait;
use serenity::model::id::{GuildId, UserId};
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::{Snapshot, SnapshotStore};
use crate::error::PersistenceError;

/// Almacén de snapshots basado en archivos JSON
pub struct JsonSnapshotStore {
    queues_dir: PathBuf,
}

impl JsonSnapshotStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, PersistenceError> {
        let queues_dir = data_dir.join("queues");
        fs::create_dir_all(&queues_dir).await?;

        info!("📁 Snapshots de colas en: {}", queues_dir.display());
        Ok(Self { queues_dir })
    }

    fn file_path(&self, room: GuildId, instance: UserId) -> PathBuf {
        self.queues_dir
            .join(format!("guild_{}_bot_{}.json", room, instance))
    }

    /// Extrae el guild de un nombre `guild_<id>_bot_<instancia>.json`
    fn parse_file_name(name: &str, instance: UserId) -> Option<GuildId> {
        let rest = name.strip_prefix("guild_")?.strip_suffix(".json")?;
        let (guild, bot) = rest.split_once("_bot_")?;
        if bot.parse::<u64>().ok()? != instance.get() {
            return None;
        }
        guild.parse::<u64>().ok().filter(|id| *id != 0).map(GuildId::new)
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn get(&self, room: GuildId, instance: UserId) -> Result<Option<Snapshot>, PersistenceError> {
        let content = match fs::read_to_string(self.file_path(room, instance)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn put(&self, room: GuildId, instance: UserId, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let path = self.file_path(room, instance);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&snapshot)?;

        // Escritura atómica: un corte a medias nunca deja un JSON truncado
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, room: GuildId, instance: UserId) -> Result<(), PersistenceError> {
        match fs::remove_file(self.file_path(room, instance)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, instance: UserId) -> Result<Vec<GuildId>, PersistenceError> {
        let mut files = fs::read_dir(&self.queues_dir).await?;
        let mut rooms = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let name = entry.file_name();
            match name.to_str().and_then(|n| Self::parse_file_name(n, instance)) {
                Some(room) => rooms.push(room),
                None => {
                    if name.to_string_lossy().ends_with(".tmp") {
                        warn!("Archivo temporal huérfano: {}", entry.path().display());
                    }
                }
            }
        }

        rooms.sort();
        if !rooms.is_empty() {
            info!("📂 {} snapshots encontrados para instancia {}", rooms.len(), instance);
        }
        Ok(rooms)
    }
}
