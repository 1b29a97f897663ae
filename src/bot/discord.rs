//! # Discord Gateway
//!
//! serenity and songbird implementations of the engine's gateway traits.
//!
//! ## Audio pipeline
//!
//! The resolved byte stream (extractor output or cached artifact) is piped
//! into an `ffmpeg` process that applies the seek offset and the enabled
//! filters and writes interleaved 48 kHz stereo `f32le` PCM. songbird reads
//! that through a [`RawAdapter`]. The ffmpeg output is not seekable, so a
//! resume position is always applied with `-ss` when the resource is built.

use async_trait::async_trait;
use serenity::{
    cache::Cache,
    http::Http,
    model::{
        channel::{Channel, ChannelType},
        id::{ChannelId, GuildId, UserId},
    },
};
use songbird::{
    input::{AsyncAdapterStream, AsyncMediaSource, AudioStreamError, Input, RawAdapter},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    io::{self, SeekFrom},
    pin::Pin,
    process::Stdio,
    sync::{Arc, OnceLock},
    task::{Context as TaskContext, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf},
    process::{Child, ChildStdout, Command},
    sync::Mutex,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ConnectionError, StreamError},
    gateway::{
        ChannelKind, Gateway, PlayRequest, PlaybackHandle, RoomSignal, SignalSender,
        VoiceConnection,
    },
    sources::AudioStream,
};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u32 = 2;
/// Buffer del adaptador async -> sync de songbird
const ADAPTER_BUFFER: usize = 64 * 1024;

/// Argumentos de ffmpeg para transcodificar a PCM con seek y filtros
pub fn ffmpeg_args(seek: Duration, filters: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if !seek.is_zero() {
        args.push("-ss".to_string());
        args.push(format!("{:.3}", seek.as_secs_f64()));
    }

    args.extend(["-i", "pipe:0"].iter().map(|s| s.to_string()));

    if let Some(chain) = filters.filter(|chain| !chain.is_empty()) {
        args.push("-af".to_string());
        args.push(chain.to_string());
    }

    args.extend(
        [
            "-vn",
            "-f",
            "f32le",
            "-ar",
            &SAMPLE_RATE.to_string(),
            "-ac",
            &CHANNELS.to_string(),
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

/// Salida de ffmpeg; mantiene vivo el proceso mientras songbird lee
struct FfmpegOutput {
    stdout: ChildStdout,
    _child: Child,
}

impl AsyncRead for FfmpegOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncSeek for FfmpegOutput {
    fn start_seek(self: Pin<&mut Self>, _position: SeekFrom) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "la salida de ffmpeg no admite seek"))
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(0))
    }
}

#[async_trait]
impl AsyncMediaSource for FfmpegOutput {
    fn is_seekable(&self) -> bool {
        false
    }

    async fn byte_len(&self) -> Option<u64> {
        None
    }

    async fn try_resume(
        &mut self,
        _offset: u64,
    ) -> Result<Box<dyn AsyncMediaSource>, AudioStreamError> {
        Err(AudioStreamError::Unsupported)
    }
}

/// Copia el stream hacia ffmpeg.
///
/// ffmpeg sólo ve un EOF cuando el extractor falla, así que el fallo se
/// emite como [`RoomSignal::TrackFailed`] antes de cerrar su entrada; el
/// `End` que songbird produce después llega con la generación ya obsoleta.
pub async fn feed_transcoder<R, W>(
    mut stream: R,
    mut stdin: W,
    guild: GuildId,
    generation: u64,
    signals: &SignalSender,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut stream, &mut stdin).await {
        Ok(bytes) => debug!("📤 {} bytes enviados a ffmpeg", bytes),
        // ffmpeg cerrado por stop/skip
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("ffmpeg cerrado antes de terminar el stream en guild {}", guild)
        }
        Err(e) => {
            warn!("❌ Stream de audio interrumpido en guild {}: {}", guild, e);
            let signal = RoomSignal::TrackFailed {
                guild,
                generation,
                reason: e.to_string(),
            };
            if signals.send(signal).is_err() {
                debug!("Bucle de señales cerrado para guild {}", guild);
            }
        }
    }
    drop(stdin);
}

/// Lanza ffmpeg alimentado por `stream` y devuelve la entrada para songbird
pub fn transcode(
    program: &str,
    stream: AudioStream,
    seek: Duration,
    filters: Option<&str>,
    guild: GuildId,
    generation: u64,
    signals: SignalSender,
) -> Result<Input, StreamError> {
    let mut child = Command::new(program)
        .args(ffmpeg_args(seek, filters))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| StreamError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| StreamError::Playback("stdin de ffmpeg no disponible".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamError::Playback("stdout de ffmpeg no disponible".to_string()))?;

    tokio::spawn(async move {
        feed_transcoder(stream, stdin, guild, generation, &signals).await;
    });

    let output: Box<dyn AsyncMediaSource> = Box::new(FfmpegOutput {
        stdout,
        _child: child,
    });
    let adapter = AsyncAdapterStream::new(output, ADAPTER_BUFFER);
    Ok(RawAdapter::new(adapter, SAMPLE_RATE, CHANNELS).into())
}

/// Gateway de Discord para una identidad del bot
pub struct DiscordGateway {
    instance: UserId,
    songbird: Arc<Songbird>,
    client: OnceLock<(Arc<Http>, Arc<Cache>)>,
    ffmpeg: String,
    connect_timeout: Duration,
}

impl DiscordGateway {
    pub fn new(instance: UserId, songbird: Arc<Songbird>, ffmpeg: String, connect_timeout: Duration) -> Self {
        Self {
            instance,
            songbird,
            client: OnceLock::new(),
            ffmpeg,
            connect_timeout,
        }
    }

    /// Conecta el gateway al cliente una vez construido
    pub fn attach(&self, http: Arc<Http>, cache: Arc<Cache>) {
        if self.client.set((http, cache)).is_err() {
            warn!("El gateway de {} ya estaba conectado", self.instance);
        }
    }

    fn http(&self) -> Option<&Arc<Http>> {
        self.client.get().map(|(http, _)| http)
    }

    fn cache(&self) -> Option<&Arc<Cache>> {
        self.client.get().map(|(_, cache)| cache)
    }

    /// Canal de voz actual de un usuario según la cache
    pub fn user_voice_channel(&self, guild: GuildId, user: UserId) -> Option<ChannelId> {
        let cache = self.cache()?;
        let guild = cache.guild(guild)?;
        guild.voice_states.get(&user).and_then(|state| state.channel_id)
    }

    fn is_bot(cache: &Cache, member_bot: Option<bool>, user: UserId) -> bool {
        member_bot
            .or_else(|| cache.user(user).map(|u| u.bot))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Gateway for DiscordGateway {
    fn instance_id(&self) -> UserId {
        self.instance
    }

    async fn channel_kind(&self, guild: GuildId, channel: ChannelId) -> Option<ChannelKind> {
        let http = self.http()?;
        let channel = match channel.to_channel(http.as_ref()).await {
            Ok(Channel::Guild(channel)) if channel.guild_id == guild => channel,
            Ok(_) => return Some(ChannelKind::Other),
            Err(e) => {
                debug!("Canal {} no disponible: {}", channel, e);
                return None;
            }
        };

        Some(match channel.kind {
            ChannelType::Text | ChannelType::News => ChannelKind::Text,
            ChannelType::Voice | ChannelType::Stage => ChannelKind::Voice,
            _ => ChannelKind::Other,
        })
    }

    async fn voice_occupants(&self, guild: GuildId, channel: ChannelId) -> usize {
        let Some(cache) = self.cache() else { return 0 };
        let Some(guild) = cache.guild(guild) else { return 0 };

        guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel))
            .filter(|state| {
                let member_bot = state.member.as_ref().map(|m| m.user.bot);
                !Self::is_bot(cache, member_bot, state.user_id)
            })
            .count()
    }

    async fn resolve_member(&self, guild: GuildId, user: UserId) -> bool {
        if let Some(cache) = self.cache() {
            if cache.member(guild, user).is_some() {
                return true;
            }
        }
        match self.http() {
            Some(http) => guild.member(http.as_ref(), user).await.is_ok(),
            None => false,
        }
    }

    async fn join_voice(
        &self,
        guild: GuildId,
        channel: ChannelId,
        signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectionError> {
        if self.client.get().is_none() {
            return Err(ConnectionError::NotReady);
        }

        let call = tokio::time::timeout(self.connect_timeout, self.songbird.join(guild, channel))
            .await
            .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
            .map_err(|e| ConnectionError::Join {
                channel,
                reason: e.to_string(),
            })?;

        info!("🔊 Conectado al canal de voz {} en guild {}", channel, guild);
        Ok(Arc::new(SongbirdConnection {
            guild,
            channel,
            call,
            songbird: Arc::clone(&self.songbird),
            signals,
            ffmpeg: self.ffmpeg.clone(),
        }))
    }

    async fn send_message(&self, channel: ChannelId, content: String) -> anyhow::Result<()> {
        let http = self
            .http()
            .ok_or_else(|| anyhow::anyhow!("gateway sin cliente"))?;
        channel.say(http.as_ref(), content).await?;
        Ok(())
    }
}

/// Conexión de voz respaldada por un `Call` de songbird
pub struct SongbirdConnection {
    guild: GuildId,
    channel: ChannelId,
    call: Arc<Mutex<Call>>,
    songbird: Arc<Songbird>,
    signals: SignalSender,
    ffmpeg: String,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    async fn play(&self, request: PlayRequest) -> Result<Box<dyn PlaybackHandle>, StreamError> {
        let PlayRequest {
            guild,
            generation,
            stream,
            seek,
            filters,
            live,
        } = request;

        let input = transcode(
            &self.ffmpeg,
            stream,
            seek,
            filters.as_deref(),
            guild,
            generation,
            self.signals.clone(),
        )?;
        let handle = self.call.lock().await.play_only_input(input);

        let notifier = TrackNotifier {
            guild,
            generation,
            signals: self.signals.clone(),
        };
        handle
            .add_event(Event::Track(TrackEvent::End), notifier.clone())
            .map_err(|e| StreamError::Playback(e.to_string()))?;
        handle
            .add_event(Event::Track(TrackEvent::Error), notifier)
            .map_err(|e| StreamError::Playback(e.to_string()))?;

        debug!(
            "▶️ Recurso gen {} en guild {} (live: {}, filtros: {:?})",
            generation, guild, live, filters
        );
        Ok(Box::new(SongbirdPlayback {
            handle,
            offset: seek,
        }))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.songbird.remove(self.guild).await {
            warn!("Error al salir del canal de voz en guild {}: {}", self.guild, e);
        } else {
            info!("👋 Desconectado del canal de voz en guild {}", self.guild);
        }
    }
}

struct SongbirdPlayback {
    handle: TrackHandle,
    offset: Duration,
}

#[async_trait]
impl PlaybackHandle for SongbirdPlayback {
    fn pause(&self) -> Result<(), StreamError> {
        self.handle
            .pause()
            .map_err(|e| StreamError::Playback(e.to_string()))
    }

    fn resume(&self) -> Result<(), StreamError> {
        self.handle
            .play()
            .map_err(|e| StreamError::Playback(e.to_string()))
    }

    fn stop(&self) {
        if let Err(e) = self.handle.stop() {
            debug!("El recurso ya estaba detenido: {}", e);
        }
    }

    fn set_gain(&self, gain: f32) -> Result<(), StreamError> {
        self.handle
            .set_volume(gain)
            .map_err(|e| StreamError::Playback(e.to_string()))
    }

    async fn position(&self) -> Option<Duration> {
        let state = self.handle.get_info().await.ok()?;
        Some(self.offset + state.position)
    }
}

/// Traduce eventos de pista de songbird a señales del motor
#[derive(Clone)]
struct TrackNotifier {
    guild: GuildId,
    generation: u64,
    signals: SignalSender,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let signal = match ctx {
            EventContext::Track(tracks) => {
                let errored = tracks.iter().find_map(|(state, _)| match &state.playing {
                    songbird::tracks::PlayMode::Errored(e) => Some(e.to_string()),
                    _ => None,
                });
                match errored {
                    Some(reason) => {
                        error!("❌ Error en pista de guild {}: {}", self.guild, reason);
                        RoomSignal::TrackFailed {
                            guild: self.guild,
                            generation: self.generation,
                            reason,
                        }
                    }
                    None => RoomSignal::TrackEnded {
                        guild: self.guild,
                        generation: self.generation,
                    },
                }
            }
            _ => return None,
        };

        if self.signals.send(signal).is_err() {
            debug!("Bucle de señales cerrado para guild {}", self.guild);
        }
        None
    }
}
