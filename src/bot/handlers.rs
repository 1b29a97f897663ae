use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        effects::AudioFilter,
        manager::{EnqueueRequest, QueueView},
        player::{LoopMode, PlayerStatus},
        track::QueueEntry,
    },
    bot::{
        preconditions::{self, Invocation, Rejection, Verdict},
        QueueBot,
    },
    coordinator,
    error::QueueError,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &QueueBot) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, Rejection::NotInGuild.message(), true).await;
    };

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let user_voice = bot.gateway.user_voice_channel(guild_id, command.user.id);
    let instance = bot.manager.instance();
    if !bot.federation.should_respond(instance, guild_id, user_voice) {
        let owner = coordinator::owner_of(guild_id, user_voice, &bot.federation.state());
        debug!("Comando en guild {} delegado a {:?}", guild_id, owner);
        return respond(ctx, &command, &redirect_message(owner), true).await;
    }

    let invocation = invocation(bot, guild_id, user_voice).await;
    if let Verdict::Reject(rejection) =
        preconditions::evaluate(preconditions::for_command(&command.data.name), &invocation)
    {
        return respond(ctx, &command, rejection.message(), true).await;
    }

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id, user_voice).await?,
        "pause" => handle_pause(ctx, &command, bot, guild_id).await?,
        "resume" => handle_resume(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "voteskip" => handle_voteskip(ctx, &command, bot, guild_id).await?,
        "stop" => handle_stop(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await?,
        "shuffle" => handle_shuffle(ctx, &command, bot, guild_id).await?,
        "loop" => handle_loop(ctx, &command, bot, guild_id).await?,
        "volume" => handle_volume(ctx, &command, bot, guild_id).await?,
        "filter" => handle_filter(ctx, &command, bot, guild_id).await?,
        "remove" => handle_remove(ctx, &command, bot, guild_id).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &QueueBot,
    guild_id: GuildId,
    user_voice: Option<ChannelId>,
) -> Result<()> {
    let query = option_str(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;
    let voice_channel = user_voice.ok_or_else(|| anyhow::anyhow!("Usuario fuera de voz"))?;

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let track = match bot.manager.resolver().extractor().probe(query).await {
        Ok(track) => track,
        Err(e) => {
            warn!("Búsqueda fallida para '{}': {}", query, e);
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().content("❌ No se encontraron resultados"),
                )
                .await?;
            return Ok(());
        }
    };

    let request = EnqueueRequest {
        guild: guild_id,
        text_channel: command.channel_id,
        voice_channel,
        track: track.clone(),
        requester: command.user.id,
    };

    let edit = match bot.manager.enqueue(request).await {
        Ok(outcome) => EditInteractionResponse::new().embed(embeds::track_added_embed(
            &track,
            outcome.position,
            outcome.started,
        )),
        Err(e) => EditInteractionResponse::new().content(error_message(&e)),
    };
    command.edit_response(&ctx.http, edit).await?;

    Ok(())
}

async fn handle_pause(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.pause(guild_id).await {
        Ok(true) => "⏸️ Reproducción pausada".to_string(),
        Ok(false) => "⏸️ La reproducción ya estaba pausada".to_string(),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_resume(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.resume(guild_id).await {
        Ok(true) => "▶️ Reproducción reanudada".to_string(),
        Ok(false) => "▶️ La reproducción no estaba pausada".to_string(),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_skip(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.skip(guild_id).await {
        Ok(outcome) => match outcome.skipped {
            Some(title) => format!("⏭️ Saltada: **{}**", title),
            None => "⏭️ Saltada".to_string(),
        },
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_voteskip(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.vote_skip(guild_id, command.user.id).await {
        Ok(outcome) if outcome.skipped.is_some() => {
            format!("⏭️ Votación aprobada ({}/{})", outcome.votes, outcome.needed)
        }
        Ok(outcome) => format!("🗳️ Voto registrado ({}/{})", outcome.votes, outcome.needed),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_stop(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.stop(guild_id).await {
        Ok(()) => "⏹️ Reproducción detenida y cola limpiada".to_string(),
        Err(e) => error_message(&e),
    };
    respond(ctx, command, &message, false).await
}

async fn handle_queue(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let page = option_i64(command, "page").unwrap_or(1).max(1) as usize;

    match bot.manager.queue_view(guild_id).await {
        Ok(view) => respond_embed(ctx, command, embeds::queue_embed(&view, page)).await,
        Err(e) => respond(ctx, command, &error_message(&e), true).await,
    }
}

async fn handle_nowplaying(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let view = match bot.manager.queue_view(guild_id).await {
        Ok(view) => view,
        Err(e) => return respond(ctx, command, &error_message(&e), true).await,
    };

    match &view.now_playing {
        Some(entry) if view.status != PlayerStatus::Idle => {
            respond_embed(ctx, command, embeds::now_playing_embed(entry, &view)).await
        }
        _ => respond(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await,
    }
}

async fn handle_shuffle(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match bot.manager.toggle_shuffle(guild_id).await {
        Ok(true) => "🔀 Modo aleatorio activado".to_string(),
        Ok(false) => "➡️ Modo aleatorio desactivado".to_string(),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_loop(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let mode = parse_loop_mode(option_str(command, "mode").unwrap_or("off"));

    let message = match bot.manager.set_loop_mode(guild_id, mode).await {
        Ok(()) => format!("Repetición: {}", mode),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_volume(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let message = match option_i64(command, "level") {
        Some(level) => {
            let percent = level.clamp(0, 200) as u32;
            match bot.manager.set_volume(guild_id, percent).await {
                Ok(()) => format!("🔊 Volumen ajustado a {}%", percent),
                Err(e) => error_message(&e),
            }
        }
        None => match bot.manager.queue_view(guild_id).await {
            Ok(view) => format!("🔊 Volumen actual: {}%", view.volume),
            Err(e) => error_message(&e),
        },
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_filter(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let filter = match option_str(command, "name").map(str::parse::<AudioFilter>) {
        Some(Ok(filter)) => filter,
        Some(Err(e)) => return respond(ctx, command, &format!("❌ {}", e), true).await,
        None => return respond(ctx, command, "❌ Filtro no proporcionado", true).await,
    };
    let enabled = option_bool(command, "enabled").unwrap_or(true);

    let message = match bot.manager.set_filter(guild_id, filter, enabled).await {
        Ok(true) if enabled => format!("🎛️ Filtro **{}** activado", filter),
        Ok(true) => format!("🎛️ Filtro **{}** desactivado", filter),
        Ok(false) => format!("🎛️ El filtro **{}** ya estaba así", filter),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

async fn handle_remove(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, guild_id: GuildId) -> Result<()> {
    let position = option_i64(command, "position").unwrap_or(0);

    let key = match bot.manager.queue_view(guild_id).await {
        Ok(view) => entry_at(&view, position).map(|entry| entry.key.clone()),
        Err(e) => return respond(ctx, command, &error_message(&e), true).await,
    };
    let Some(key) = key else {
        return respond(ctx, command, &error_message(&QueueError::UnknownEntry), true).await;
    };

    let message = match bot.manager.remove(guild_id, &key).await {
        Ok(removed) => format!("➖ Quitada: **{}**", removed.track.title),
        Err(e) => error_message(&e),
    };
    notice(ctx, command, bot, &message).await
}

// Funciones auxiliares

async fn invocation(bot: &QueueBot, guild_id: GuildId, user_voice: Option<ChannelId>) -> Invocation {
    let mut invocation = Invocation {
        in_guild: true,
        user_voice,
        ..Invocation::default()
    };

    if let Some(slot) = bot.manager.slot(guild_id) {
        invocation.room_voice = Some(slot.voice_channel);
        invocation.playing = slot.queue.lock().await.current_key().is_some();
    }
    invocation
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(ctx: &Context, command: &CommandInteraction, embed: serenity::builder::CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

/// Responde y programa el borrado de la respuesta
async fn notice(ctx: &Context, command: &CommandInteraction, bot: &QueueBot, content: &str) -> Result<()> {
    respond(ctx, command, content, false).await?;

    let http = Arc::clone(&ctx.http);
    let interaction = command.clone();
    bot.notices.schedule(command.id, bot.config.notice_ttl(), async move {
        if let Err(e) = interaction.delete_response(&http).await {
            debug!("No se pudo borrar el aviso {}: {}", interaction.id, e);
        }
    });
    Ok(())
}

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_str())
}

fn option_i64(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_i64())
}

fn option_bool(command: &CommandInteraction, name: &str) -> Option<bool> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .and_then(|opt| opt.value.as_bool())
}

fn error_message(error: &QueueError) -> String {
    match error {
        QueueError::SkipInProgress => "⏳ Ya hay un salto en progreso, espera un momento".to_string(),
        other => format!("❌ {}", other),
    }
}

fn parse_loop_mode(value: &str) -> LoopMode {
    match value {
        "song" | "track" => LoopMode::Song,
        "queue" => LoopMode::Queue,
        _ => LoopMode::Off,
    }
}

/// Entrada en la posición mostrada por `/queue` (1 = primera pendiente)
fn entry_at(view: &QueueView, position: i64) -> Option<&QueueEntry> {
    let index = usize::try_from(position).ok()?.checked_sub(1)?;
    view.upcoming.get(index)
}

fn redirect_message(owner: Option<UserId>) -> String {
    match owner {
        Some(owner) => format!("🤖 <@{}> atiende la música en este servidor, usa sus comandos", owner),
        None => "🤖 Ninguna instancia puede atender este servidor ahora".to_string(),
    }
}
