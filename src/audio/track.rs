use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, time::Duration};

/// Pista reproducible, inmutable una vez creada
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub url: String,
    pub thumbnail: Option<String>,
    /// Duración en segundos; 0 para contenido en vivo o desconocido
    pub duration: u64,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            thumbnail: None,
            duration: 0,
        }
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration = seconds;
        self
    }

    /// Las pistas sin duración conocida se tratan como streams en vivo
    pub fn is_live(&self) -> bool {
        self.duration == 0
    }

    pub fn length(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    /// Duración legible ("3m 25s", "🔴 En vivo")
    pub fn display_duration(&self) -> String {
        match self.length() {
            Some(length) => humantime::format_duration(length).to_string(),
            None => "🔴 En vivo".to_string(),
        }
    }
}

/// Clave opaca de una entrada; nunca se reutiliza
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKey(String);

impl EntryKey {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntryKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Una pista dentro de la colección de un guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: EntryKey,
    pub index: u64,
    pub track: Track,
    pub requester: UserId,
}
