use parking_lot::RwLock;
use serenity::{all::ActivityData, prelude::Context};
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::audio::manager::QueueManager;

/// Estado de presencia publicado por la identidad primaria
#[derive(Debug, Default)]
pub struct PresenceBoard {
    activity: RwLock<Option<String>>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publica una actividad; devuelve `true` si cambió
    pub fn publish(&self, activity: String) -> bool {
        let mut current = self.activity.write();
        if current.as_deref() == Some(activity.as_str()) {
            return false;
        }
        *current = Some(activity);
        true
    }

    pub fn current(&self) -> Option<String> {
        self.activity.read().clone()
    }
}

/// Texto de actividad según las salas activas de la primaria
pub fn activity_text(active_rooms: usize) -> String {
    match active_rooms {
        0 => "/play".to_string(),
        1 => "🎶 en 1 servidor".to_string(),
        n => format!("🎶 en {} servidores", n),
    }
}

/// Indica si la actividad aplicada debe actualizarse
pub fn needs_update(applied: Option<&str>, published: Option<&str>) -> bool {
    published.is_some() && applied != published
}

/// Bucle de espejo de presencia.
///
/// La primaria publica su actividad en el tablero y todas las identidades
/// (primaria incluida) aplican lo publicado cuando cambia.
pub fn spawn_mirror(
    ctx: Context,
    board: Arc<PresenceBoard>,
    manager: Arc<QueueManager>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        let mut applied: Option<String> = None;

        loop {
            interval.tick().await;

            let instance = manager.instance();
            if manager.federation().is_primary(instance) {
                board.publish(activity_text(manager.active_rooms()));
            }

            let published = board.current();
            if needs_update(applied.as_deref(), published.as_deref()) {
                if let Some(text) = published.clone() {
                    debug!("🪞 Presencia de {} actualizada: {}", instance, text);
                    ctx.set_activity(Some(ActivityData::listening(text)));
                }
                applied = published;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn publish_reports_changes_only() {
        let board = PresenceBoard::new();
        assert!(board.publish(activity_text(0)));
        assert!(!board.publish(activity_text(0)));
        assert!(board.publish(activity_text(2)));
        assert_eq!(board.current().as_deref(), Some("🎶 en 2 servidores"));
    }

    #[test]
    fn secondaries_mirror_until_in_sync() {
        assert!(!needs_update(None, None));
        assert!(needs_update(None, Some("/play")));
        assert!(!needs_update(Some("/play"), Some("/play")));
        assert!(needs_update(Some("/play"), Some("🎶 en 1 servidor")));
    }
}
