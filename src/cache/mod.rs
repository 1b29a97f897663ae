//! # Cache Module
//!
//! On-disk cache of extracted audio, keyed by the track's source URL.
//!
//! Artifacts are written while a track streams for the first time (see
//! the tee in [`crate::sources`]) and served straight from disk on the next
//! request. The cache is:
//!
//! - **Wiped on start**: every artifact from a previous process is removed
//!   when [`StreamCache::open`] runs.
//! - **Bounded**: total size is capped by `CACHE_MAX_BYTES`; least recently
//!   used artifacts are evicted after each commit.
//! - **Best-effort**: a write is committed only after the extractor exits
//!   cleanly; partial files are discarded.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_DIR=/app/cache          # Artifact directory (cleared on start)
//! CACHE_MAX_BYTES=2147483648    # Total size bound
//! ```

pub mod lru_cache;

use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashSet},
    hash::{Hash, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{fs, io::AsyncWriteExt, sync::mpsc};
use tracing::{debug, info, warn};

use lru_cache::ByteLru;

/// Chunks encolados hacia el escritor del cache antes de abandonarlo
pub const CACHE_SINK_CAPACITY: usize = 256;

/// Mensajes del tee hacia el escritor del cache
#[derive(Debug)]
pub enum CacheChunk {
    Data(Bytes),
    /// El extractor terminó correctamente; el artefacto puede confirmarse
    Done,
}

pub type CacheSink = mpsc::Sender<CacheChunk>;

/// Cache de audio en disco con desalojo LRU por tamaño
#[derive(Debug)]
pub struct StreamCache {
    dir: PathBuf,
    index: Mutex<ByteLru<String, PathBuf>>,
    in_flight: Mutex<HashSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StreamCache {
    /// Abre el directorio del cache borrando cualquier artefacto previo
    pub async fn open(dir: impl AsRef<Path>, max_bytes: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("🧹 Artefactos anteriores eliminados de {}", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&dir).await?;

        info!(
            "🗄️ Cache de audio en {} (límite {} MB)",
            dir.display(),
            max_bytes / (1024 * 1024)
        );

        Ok(Self {
            dir,
            index: Mutex::new(ByteLru::new(max_bytes)),
            in_flight: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Abre el artefacto de una URL si existe
    pub async fn open_artifact(&self, url: &str) -> Option<fs::File> {
        let path = self.index.lock().get(&url.to_string()).cloned();

        let Some(path) = path else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match fs::File::open(&path).await {
            Ok(file) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("✅ Cache hit para {}", url);
                Some(file)
            }
            Err(e) => {
                warn!("Artefacto ilegible para {}: {}", url, e);
                self.index.lock().remove(&url.to_string());
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.lock().contains(&url.to_string())
    }

    /// Reserva la escritura de un artefacto y lanza su escritor.
    ///
    /// Devuelve `None` si la URL ya está en cache o alguien la está escribiendo.
    pub fn begin_write(self: &Arc<Self>, url: &str) -> Option<CacheSink> {
        if self.contains(url) || !self.in_flight.lock().insert(url.to_string()) {
            return None;
        }

        let (tx, rx) = mpsc::channel(CACHE_SINK_CAPACITY);
        let cache = Arc::clone(self);
        let url = url.to_string();
        tokio::spawn(async move {
            cache.write_artifact(url, rx).await;
        });
        Some(tx)
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        CacheStats {
            artifacts: index.len(),
            total_bytes: index.total_bytes(),
            capacity_bytes: index.capacity_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    // Funciones privadas

    fn artifact_path(&self, url: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        self.dir.join(format!("{:016x}.audio", hasher.finish()))
    }

    async fn write_artifact(&self, url: String, mut rx: mpsc::Receiver<CacheChunk>) {
        let path = self.artifact_path(&url);
        let partial = path.with_extension("part");

        let outcome = async {
            let mut file = fs::File::create(&partial).await?;
            let mut size = 0u64;
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    CacheChunk::Data(bytes) => {
                        file.write_all(&bytes).await?;
                        size += bytes.len() as u64;
                    }
                    CacheChunk::Done => {
                        file.flush().await?;
                        return Ok(Some(size));
                    }
                }
            }
            Ok::<_, std::io::Error>(None)
        }
        .await;

        match outcome {
            Ok(Some(size)) => match fs::rename(&partial, &path).await {
                Ok(()) => self.commit(&url, path, size).await,
                Err(e) => {
                    warn!("No se pudo confirmar el artefacto de {}: {}", url, e);
                    let _ = fs::remove_file(&partial).await;
                }
            },
            Ok(None) => {
                debug!("✂️ Escritura de cache abandonada para {}", url);
                let _ = fs::remove_file(&partial).await;
            }
            Err(e) => {
                warn!("Error escribiendo cache para {}: {}", url, e);
                let _ = fs::remove_file(&partial).await;
            }
        }

        self.in_flight.lock().remove(&url);
    }

    async fn commit(&self, url: &str, path: PathBuf, size: u64) {
        let discarded = self.index.lock().insert(url.to_string(), path, size);

        for (old_url, old_path) in discarded {
            // Un reemplazo de la misma URL comparte ruta con el artefacto nuevo
            if old_url == url && self.contains(url) {
                continue;
            }
            debug!("🗑️ Desalojando artefacto de {}", old_url);
            if let Err(e) = fs::remove_file(&old_path).await {
                warn!("No se pudo borrar {}: {}", old_path.display(), e);
            }
        }

        if self.contains(url) {
            debug!("💾 Artefacto guardado para {} ({} bytes)", url, size);
        }
    }
}

/// Estadísticas del cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub artifacts: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}
