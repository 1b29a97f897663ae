//! # Sources Module
//!
//! Turns a [`Track`] into a byte stream through the external extraction
//! tool, transparently caching finite tracks.
//!
//! ## Resolution policy
//!
//! 1. Live tracks bypass the cache entirely.
//! 2. A cached artifact for the track URL is served from disk.
//! 3. Otherwise the extractor is spawned and its output is **teed**: one
//!    branch feeds playback, the other the cache writer. The cache branch
//!    uses `try_send`, so a slow disk drops the cache write instead of
//!    stalling playback.
//!
//! A non-zero exit of the extractor surfaces to the reader as an I/O
//! error at the end of the stream, and the partial artifact is discarded.

pub mod ytdlp;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{channel::mpsc as stream_mpsc, future::BoxFuture, SinkExt};
use std::{io, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::{
    audio::track::Track,
    cache::{CacheChunk, CacheSink, StreamCache},
    error::StreamError,
};

pub use ytdlp::YtDlpExtractor;

/// Stream de bytes de audio listo para el pipeline de reproducción
pub type AudioStream = Box<dyn AsyncRead + Send + Unpin>;

/// Tamaño de lectura del tee
const CHUNK_SIZE: usize = 16 * 1024;
/// Chunks en vuelo hacia la reproducción
const PLAYBACK_BUFFER: usize = 32;

/// Opciones para el extractor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub format: String,
    pub bitrate_limit_kbps: Option<u32>,
    pub live_mode: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            format: "bestaudio".to_string(),
            bitrate_limit_kbps: None,
            live_mode: false,
        }
    }
}

/// Proceso de extracción en curso
pub struct Extraction {
    pub stdout: AudioStream,
    /// Se resuelve cuando el proceso termina; error si el código de salida no es 0
    pub exit: BoxFuture<'static, Result<(), StreamError>>,
}

/// Herramienta externa que convierte URLs en audio
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str, options: &ExtractOptions) -> Result<Extraction, StreamError>;

    /// Obtiene metadatos de una URL o búsqueda
    async fn probe(&self, query: &str) -> Result<Track, StreamError>;
}

/// Resuelve pistas a streams usando el cache cuando es posible
pub struct StreamResolver {
    extractor: Arc<dyn Extractor>,
    cache: Arc<StreamCache>,
    options: ExtractOptions,
}

impl StreamResolver {
    pub fn new(extractor: Arc<dyn Extractor>, cache: Arc<StreamCache>, options: ExtractOptions) -> Self {
        Self {
            extractor,
            cache,
            options,
        }
    }

    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    pub fn cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    pub async fn resolve(&self, track: &Track) -> Result<AudioStream, StreamError> {
        if track.is_live() {
            info!("📡 Stream en vivo sin cache: {}", track.title);
            let options = ExtractOptions {
                live_mode: true,
                ..self.options.clone()
            };
            let extraction = self.extractor.extract(&track.url, &options).await?;
            return Ok(tee(extraction, None));
        }

        if let Some(file) = self.cache.open_artifact(&track.url).await {
            info!("💾 Reproduciendo desde cache: {}", track.title);
            return Ok(Box::new(file));
        }

        let extraction = self.extractor.extract(&track.url, &self.options).await?;
        let sink = self.cache.begin_write(&track.url);
        debug!(
            "🔀 Tee para {} (cache {})",
            track.title,
            if sink.is_some() { "activo" } else { "omitido" }
        );
        Ok(tee(extraction, sink))
    }
}

/// Divide la salida del extractor entre reproducción y cache
pub fn tee(extraction: Extraction, cache: Option<CacheSink>) -> AudioStream {
    let (tx, rx) = stream_mpsc::channel::<io::Result<Bytes>>(PLAYBACK_BUFFER);
    tokio::spawn(pump(extraction, tx, cache));
    Box::new(StreamReader::new(rx))
}

async fn pump(
    extraction: Extraction,
    mut playback: stream_mpsc::Sender<io::Result<Bytes>>,
    mut cache: Option<CacheSink>,
) {
    let Extraction { mut stdout, exit } = extraction;
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let mut listening = true;

    loop {
        buf.reserve(CHUNK_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();

                if let Some(sink) = &cache {
                    if sink.try_send(CacheChunk::Data(chunk.clone())).is_err() {
                        warn!("🐢 Escritura de cache demasiado lenta, se abandona");
                        cache = None;
                    }
                }

                if listening && playback.send(Ok(chunk)).await.is_err() {
                    debug!("Reproducción cerrada antes de terminar el stream");
                    listening = false;
                }

                if !listening && cache.is_none() {
                    // Nadie consume ya la salida; al soltar la extracción se mata el proceso
                    return;
                }
            }
            Err(e) => {
                warn!("Error leyendo del extractor: {}", e);
                if listening {
                    let _ = playback.send(Err(e)).await;
                }
                return;
            }
        }
    }

    match exit.await {
        Ok(()) => {
            if let Some(sink) = cache {
                let _ = sink.send(CacheChunk::Done).await;
            }
        }
        Err(e) => {
            warn!("❌ El extractor falló: {}", e);
            if listening {
                let _ = playback.send(Err(io::Error::other(e.to_string()))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExtractor;
    use std::time::Duration;

    fn finite_track() -> Track {
        Track::new("a", "Song A", "https://example.com/a").with_duration(120)
    }

    async fn read_all(mut stream: AudioStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn resolver(extractor: Arc<FakeExtractor>) -> (StreamResolver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(StreamCache::open(dir.path(), 1 << 20).await.unwrap());
        (
            StreamResolver::new(extractor, cache, ExtractOptions::default()),
            dir,
        )
    }

    async fn wait_cached(cache: &StreamCache, url: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.contains(url) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("el artefacto nunca se guardó");
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let extractor = Arc::new(FakeExtractor::with_payload(b"pcm-bytes".to_vec()));
        let (resolver, _dir) = resolver(extractor.clone()).await;
        let track = finite_track();

        let first = read_all(resolver.resolve(&track).await.unwrap()).await.unwrap();
        assert_eq!(first, b"pcm-bytes");
        wait_cached(resolver.cache(), &track.url).await;

        let second = read_all(resolver.resolve(&track).await.unwrap()).await.unwrap();
        assert_eq!(second, b"pcm-bytes");
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn live_tracks_bypass_the_cache() {
        let extractor = Arc::new(FakeExtractor::with_payload(b"radio".to_vec()));
        let (resolver, _dir) = resolver(extractor.clone()).await;
        let track = Track::new("live", "Radio", "https://example.com/live");

        let bytes = read_all(resolver.resolve(&track).await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"radio");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!resolver.cache().contains(&track.url));
        assert!(extractor.last_options().unwrap().live_mode);
    }

    #[tokio::test]
    async fn failed_exit_surfaces_and_is_not_cached() {
        let extractor = Arc::new(FakeExtractor::failing_exit(b"half".to_vec()));
        let (resolver, _dir) = resolver(extractor.clone()).await;
        let track = finite_track();

        let result = read_all(resolver.resolve(&track).await.unwrap()).await;
        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!resolver.cache().contains(&track.url));
    }

    async fn extraction(payload: &[u8]) -> Extraction {
        FakeExtractor::with_payload(payload.to_vec())
            .extract("https://example.com/a", &ExtractOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn saturated_cache_sink_never_stalls_playback() {
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        // Capacidad 1 y nadie drenando: el segundo chunk ya no cabe
        let (sink, mut cache_rx) = tokio::sync::mpsc::channel(1);

        let played = read_all(tee(extraction(&payload).await, Some(sink)))
            .await
            .unwrap();
        assert_eq!(played, payload);

        let mut cached = 0;
        while let Some(chunk) = cache_rx.recv().await {
            match chunk {
                CacheChunk::Data(bytes) => cached += bytes.len(),
                CacheChunk::Done => panic!("un artefacto abandonado no debe confirmarse"),
            }
        }
        assert!(cached < payload.len());
    }

    #[tokio::test]
    async fn closed_cache_sink_is_abandoned() {
        let payload = vec![7u8; 64 * 1024];
        let (sink, cache_rx) = tokio::sync::mpsc::channel(4);
        drop(cache_rx);

        let played = read_all(tee(extraction(&payload).await, Some(sink)))
            .await
            .unwrap();
        assert_eq!(played, payload);
    }

    #[tokio::test]
    async fn spawn_failures_are_stream_errors() {
        let extractor = Arc::new(FakeExtractor::unavailable());
        let (resolver, _dir) = resolver(extractor).await;

        let result = resolver.resolve(&finite_track()).await;
        assert!(matches!(result, Err(StreamError::Spawn { .. })));
    }
}
