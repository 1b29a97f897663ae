use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::{
    manager::QueueView,
    player::{LoopMode, PlayerStatus},
    track::{QueueEntry, Track},
};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

const STANDARD_FOOTER: &str = "🎵 Queue Bot";
pub const ITEMS_PER_PAGE: usize = 10;

/// Embed de la canción actual
pub fn now_playing_embed(entry: &QueueEntry, view: &QueueView) -> CreateEmbed {
    let status = match view.status {
        PlayerStatus::Paused => "⏸️ En pausa",
        _ => "🎵 Reproduciendo Ahora",
    };

    let progress = match (view.position, entry.track.length()) {
        (Some(position), Some(length)) => {
            format!("{} / {}", format_duration(position), format_duration(length))
        }
        (_, None) => "🔴 En vivo".to_string(),
        (None, Some(length)) => format_duration(length),
    };

    let mut embed = CreateEmbed::default()
        .title(status)
        .description(format!("**{}**", entry.track.title))
        .url(&entry.track.url)
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Progreso", progress, true)
        .field("👤 Solicitado por", format!("<@{}>", entry.requester), true)
        .field("🔁 Repetición", view.loop_mode.to_string(), true)
        .field("🔊 Volumen", format!("{}%", view.volume), true);

    if !view.filters.is_empty() {
        let names: Vec<&str> = view.filters.iter().map(|f| f.name()).collect();
        embed = embed.field("🎛️ Filtros", names.join(", "), true);
    }

    if let Some(thumbnail) = &entry.track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed de canción añadida a la cola
pub fn track_added_embed(track: &Track, position: usize, started: bool) -> CreateEmbed {
    let title = if started {
        "🎵 Reproduciendo Ahora"
    } else {
        "➕ Añadida a la cola"
    };

    let mut embed = CreateEmbed::default()
        .title(title)
        .description(format!("**{}**", track.title))
        .url(&track.url)
        .color(colors::MUSIC_PURPLE)
        .field("⏱️ Duración", track.display_duration(), true)
        .field("📋 Posición", position.to_string(), true);

    if let Some(thumbnail) = &track.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }

    embed.footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Embed paginado de la cola
pub fn queue_embed(view: &QueueView, page: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if view.now_playing.is_none() && view.upcoming.is_empty() {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    if let Some(current) = &view.now_playing {
        let icon = match view.loop_mode {
            LoopMode::Song => "🔂",
            LoopMode::Queue => "🔁",
            LoopMode::Off => "▶️",
        };
        embed = embed.field(
            format!("{} Reproduciendo", icon),
            format!("**{}** `[{}]`", current.track.title, current.track.display_duration()),
            false,
        );
    }

    let (lines, pages) = page_lines(&view.upcoming, page, ITEMS_PER_PAGE);
    if !lines.is_empty() {
        embed = embed.field("Próximas canciones", lines.join("\n"), false);
    }

    let total = view.upcoming.len() + usize::from(view.now_playing.is_some());
    let mut info = format!("**Total:** {} canciones", total);
    if view.total_duration > 0 {
        info.push_str(&format!(
            " | **Duración:** {}",
            format_duration(Duration::from_secs(view.total_duration))
        ));
    }
    if view.shuffle {
        info.push_str(" | 🔀");
    }

    embed
        .field("ℹ️ Información", info, false)
        .footer(CreateEmbedFooter::new(format!(
            "Página {}/{} • {}",
            page.clamp(1, pages),
            pages,
            STANDARD_FOOTER
        )))
        .timestamp(Timestamp::now())
}

/// Líneas de una página de la cola y número total de páginas
pub fn page_lines(upcoming: &[QueueEntry], page: usize, per_page: usize) -> (Vec<String>, usize) {
    let pages = upcoming.len().div_ceil(per_page).max(1);
    let page = page.clamp(1, pages);

    let lines = upcoming
        .iter()
        .enumerate()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|(i, entry)| {
            format!(
                "**{}**. {} `[{}]`",
                i + 1,
                entry.track.title,
                entry.track.display_duration()
            )
        })
        .collect();

    (lines, pages)
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::EntryKey;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn entries(count: usize) -> Vec<QueueEntry> {
        (0..count)
            .map(|i| QueueEntry {
                key: EntryKey::from(format!("k{i}")),
                index: i as u64,
                track: Track::new(format!("id{i}"), format!("Canción {i}"), format!("https://x/{i}"))
                    .with_duration(65),
                requester: UserId::new(1),
            })
            .collect()
    }

    #[test]
    fn durations_switch_to_hours() {
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn pages_keep_global_numbering() {
        let upcoming = entries(23);
        let (lines, pages) = page_lines(&upcoming, 3, 10);
        assert_eq!(pages, 3);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "**21**. Canción 20 `[1m 5s]`");
    }

    #[test]
    fn out_of_range_page_is_clamped() {
        let upcoming = entries(4);
        let (lines, pages) = page_lines(&upcoming, 9, 10);
        assert_eq!(pages, 1);
        assert_eq!(lines.len(), 4);

        let (empty, pages) = page_lines(&[], 1, 10);
        assert!(empty.is_empty());
        assert_eq!(pages, 1);
    }
}
