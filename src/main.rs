use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod coordinator;
mod error;
mod gateway;
mod scheduler;
mod sources;
mod storage;
#[cfg(test)]
mod testing;
mod ui;

use crate::audio::manager::{ManagerSettings, QueueManager};
use crate::bot::{discord::DiscordGateway, presence::PresenceBoard, QueueBot};
use crate::cache::StreamCache;
use crate::config::Config;
use crate::coordinator::Federation;
use crate::gateway::Gateway;
use crate::sources::{ExtractOptions, StreamResolver, YtDlpExtractor};
use crate::storage::{JsonSnapshotStore, Persistence, SnapshotStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("queue_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Queue Bot v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Arc::new(Config::load()?);

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Cache de audio compartido entre identidades
    let stream_cache = Arc::new(StreamCache::open(&config.cache_dir, config.cache_max_bytes).await?);
    let extractor = Arc::new(YtDlpExtractor::new(config.ytdlp_path.clone()).with_default_cookies().await);
    let resolver = Arc::new(StreamResolver::new(
        extractor,
        stream_cache,
        ExtractOptions {
            format: config.audio_format.clone(),
            bitrate_limit_kbps: config.bitrate_limit_kbps,
            live_mode: false,
        },
    ));

    let store: Arc<dyn SnapshotStore> = Arc::new(JsonSnapshotStore::new(config.data_dir.clone()).await?);
    let federation = Arc::new(Federation::new());
    let presence = Arc::new(PresenceBoard::new());

    let settings = ManagerSettings {
        max_queue_size: config.max_queue_size,
        default_volume: config.default_volume,
        idle_timeout: config.idle_timeout(),
        ..ManagerSettings::default()
    };

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let mut clients = Vec::new();
    let mut managers = Vec::new();
    let mut order = Vec::new();

    for (position, token) in config.discord_tokens.iter().enumerate() {
        let instance = Http::new(token).get_current_user().await?.id;
        info!(
            "🤖 Identidad {} ({}): {}",
            position + 1,
            if position == 0 { "primaria" } else { "secundaria" },
            instance
        );
        order.push(instance);

        let songbird = Songbird::serenity();
        let gateway = Arc::new(DiscordGateway::new(
            instance,
            Arc::clone(&songbird),
            config.ffmpeg_path.clone(),
            config.voice_connect_timeout(),
        ));

        let persistence = Persistence::spawn(Arc::clone(&store), instance);
        let (manager, signals) = QueueManager::new(
            Arc::clone(&gateway) as Arc<dyn Gateway>,
            Arc::clone(&resolver),
            persistence,
            Arc::clone(&federation),
            settings.clone(),
        );
        tokio::spawn(Arc::clone(&manager).run_signals(signals));
        manager.spawn_snapshot_task(config.snapshot_interval());

        let handler = QueueBot::new(
            Arc::clone(&config),
            Arc::clone(&manager),
            gateway,
            Arc::clone(&presence),
        );

        let client = Client::builder(token, intents)
            .event_handler(handler)
            .register_songbird_with(songbird)
            .await?;

        managers.push(manager);
        clients.push(client);
    }

    federation.set_instance_order(order);

    // Manejar shutdown graceful
    let shard_managers: Vec<_> = clients
        .iter()
        .map(|client| Arc::clone(&client.shard_manager))
        .collect();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, guardando colas...");
        for manager in &managers {
            manager.shutdown().await;
        }
        for shard_manager in &shard_managers {
            shard_manager.shutdown_all().await;
        }
    });

    // Iniciar identidades
    info!("🚀 Bot iniciado con {} identidades", clients.len());
    let running = clients.into_iter().map(|mut client| {
        tokio::spawn(async move {
            if let Err(why) = client.start().await {
                error!("Error al ejecutar cliente: {:?}", why);
            }
        })
    });
    for result in futures::future::join_all(running).await {
        if let Err(e) = result {
            warn!("Cliente terminado de forma inesperada: {:?}", e);
        }
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = tokio::process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = tokio::process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
