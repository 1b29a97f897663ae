//! # Bot Module
//!
//! Discord host layer for one bot identity.
//!
//! [`QueueBot`] implements serenity's [`EventHandler`] and forwards
//! gateway events into the engine:
//!
//! - `ready` attaches the gateway, registers this identity in the
//!   [`Federation`] and registers the slash commands
//! - `cache_ready` restores persisted queues once voice states are cached
//! - `voice_state_update` tracks the bot's own seat (connection loss,
//!   ownership claims) and listener counts for the idle timer
//! - `interaction_create` runs the ownership check, the command
//!   preconditions and finally the command handler
//!
//! Several identities run side by side in one process, each with its own
//! `QueueBot`, sharing the same [`Federation`] and [`PresenceBoard`].

use serenity::{
    all::{
        ChannelId, Context, EventHandler, Guild, GuildId, Interaction, Ready, UnavailableGuild,
        VoiceState,
    },
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod discord;
pub mod handlers;
pub mod preconditions;
pub mod presence;

use crate::{
    audio::manager::QueueManager,
    config::Config,
    coordinator::Federation,
    gateway::{Gateway, RoomSignal},
    scheduler::TaskScheduler,
    storage::restore,
};
use discord::DiscordGateway;
use presence::PresenceBoard;

/// Manejador de eventos de una identidad del bot
pub struct QueueBot {
    config: Arc<Config>,
    manager: Arc<QueueManager>,
    gateway: Arc<DiscordGateway>,
    federation: Arc<Federation>,
    presence: Arc<PresenceBoard>,
    /// Respuestas temporales pendientes de borrar
    notices: TaskScheduler<serenity::all::InteractionId>,
    commands_registered: AtomicBool,
    restored: AtomicBool,
    mirroring: AtomicBool,
}

impl QueueBot {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<QueueManager>,
        gateway: Arc<DiscordGateway>,
        presence: Arc<PresenceBoard>,
    ) -> Self {
        let federation = Arc::clone(manager.federation());
        Self {
            config,
            manager,
            gateway,
            federation,
            presence,
            notices: TaskScheduler::new(),
            commands_registered: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            mirroring: AtomicBool::new(false),
        }
    }

    /// Oyentes humanos en el canal de la cola activa del guild
    async fn refresh_listeners(&self, guild_id: GuildId) {
        let Some(slot) = self.manager.slot(guild_id) else { return };
        let listeners = self
            .gateway
            .voice_occupants(guild_id, slot.voice_channel)
            .await;
        debug!("👥 {} oyentes en guild {}", listeners, guild_id);
        self.manager.on_listeners_changed(guild_id, listeners);
    }
}

#[async_trait]
impl EventHandler for QueueBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        self.gateway
            .attach(Arc::clone(&ctx.http), Arc::clone(&ctx.cache));
        self.federation
            .register_instance(ready.user.id, ready.guilds.iter().map(|g| g.id));

        if !self.commands_registered.swap(true, Ordering::SeqCst) {
            info!("📝 Registrando comandos slash...");
            match commands::register_global_commands(&ctx).await {
                Ok(()) => info!("✅ Comandos globales registrados"),
                Err(e) => {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    self.commands_registered.store(false, Ordering::SeqCst);
                }
            }
        }

        if !self.mirroring.swap(true, Ordering::SeqCst) {
            presence::spawn_mirror(
                ctx.clone(),
                Arc::clone(&self.presence),
                Arc::clone(&self.manager),
                self.config.presence_mirror_interval(),
            );
        }
    }

    async fn cache_ready(&self, _ctx: Context, guilds: Vec<GuildId>) {
        info!("🗂️ Cache lista con {} servidores", guilds.len());

        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            let report = restore::restore_all(manager).await;
            info!(
                "♻️ Restauración terminada: {} restauradas, {} omitidas, {} fallidas",
                report.restored, report.skipped, report.failed
            );
        });
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.federation.join_guild(self.manager.instance(), guild.id);
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if incomplete.unavailable {
            return;
        }
        self.federation.leave_guild(self.manager.instance(), incomplete.id);
        if self.manager.stop(incomplete.id).await.is_ok() {
            info!("👋 Cola cerrada al salir del guild {}", incomplete.id);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        let instance = self.manager.instance();

        if new.user_id == instance {
            self.federation
                .set_voice_channel(instance, guild_id, new.channel_id);

            // Detectar si el bot fue desconectado
            let previous = old.as_ref().and_then(|state| state.channel_id);
            if let Some(channel) = left_channel(previous, new.channel_id) {
                if !self.manager.has_room(guild_id) {
                    return;
                }
                info!("🔌 Bot desconectado de {} en guild {}", channel, guild_id);
                let signal = RoomSignal::ConnectionLost {
                    guild: guild_id,
                    channel,
                };
                if self.manager.signal_sender().send(signal).is_err() {
                    warn!("Bucle de señales cerrado para instancia {}", instance);
                }
            }
            return;
        }

        self.refresh_listeners(guild_id).await;
    }
}

/// Canal que la identidad abandonó sin pasar a otro
fn left_channel(old: Option<ChannelId>, new: Option<ChannelId>) -> Option<ChannelId> {
    match (old, new) {
        (Some(channel), None) => Some(channel),
        _ => None,
    }
}
