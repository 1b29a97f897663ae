//! Taxonomía de errores del motor de colas.
//!
//! Cada variante corresponde a un ámbito distinto de recuperación:
//! los errores de stream y conexión son por guild, los de persistencia
//! y restauración sólo se registran. Nada aquí termina el proceso.

use serenity::model::id::{ChannelId, GuildId};
use std::time::Duration;
use thiserror::Error;

/// Fallo al unirse o mantener una conexión de voz
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no se pudo unir al canal de voz {channel}: {reason}")]
    Join { channel: ChannelId, reason: String },

    #[error("la conexión de voz no estuvo lista tras {0:?}")]
    Timeout(Duration),

    #[error("el gateway todavía no está listo")]
    NotReady,

    #[error("la conexión de voz se perdió")]
    Lost,
}

/// Fallo de extracción o decodificación para una sola pista
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no se pudo lanzar {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} terminó con código {code:?}: {stderr}")]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("error de E/S en el stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("salida inválida del extractor: {0}")]
    Decode(String),

    #[error("no se pudo reproducir el recurso: {0}")]
    Playback(String),
}

/// Fallo de lectura/escritura del almacén de snapshots
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("error de E/S en el almacén: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot corrupto: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("el escritor de snapshots ya no está activo")]
    WorkerGone,
}

/// Motivos por los que se abandona la restauración de un guild
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("el canal {0} ya no existe o no es del tipo esperado")]
    InvalidChannel(ChannelId),

    #[error("el canal de voz {0} está vacío")]
    EmptyVoiceRoom(ChannelId),

    #[error("ninguna pista del snapshot pudo resolverse")]
    NoResolvableTracks,

    #[error("el guild {0} ya tiene una cola activa")]
    AlreadyActive(GuildId),

    #[error("otra instancia es dueña del guild {0}")]
    NotOwner(GuildId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RestoreError {
    /// Indica si el snapshot debe conservarse para un reintento en el próximo arranque
    pub fn keeps_snapshot(&self) -> bool {
        !matches!(self, RestoreError::NoResolvableTracks)
    }
}

/// Resultados de comandos sobre la cola que no son estados de error del guild
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no hay una cola activa en este servidor")]
    NoQueue,

    #[error("ya hay un salto en progreso")]
    SkipInProgress,

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("no existe esa entrada en la cola")]
    UnknownEntry,

    #[error("la cola fue destruida")]
    Destroyed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
