use async_trait::async_trait;
use futures::FutureExt;
use serde::Deserialize;
use std::{path::PathBuf, process::Stdio};
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{debug, error, info, warn};

use super::{ExtractOptions, Extraction, Extractor};
use crate::{audio::track::Track, error::StreamError};

/// Máximo de stderr que se conserva para los mensajes de error
const STDERR_LIMIT: usize = 4 * 1024;

/// Extractor basado en yt-dlp escribiendo el audio por stdout
pub struct YtDlpExtractor {
    program: String,
    cookies: Option<PathBuf>,
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cookies: None,
        }
    }

    /// Busca un archivo de cookies en las rutas habituales
    pub async fn with_default_cookies(mut self) -> Self {
        let candidates = [
            format!("{}/.config/yt-dlp/cookies.txt", std::env::var("HOME").unwrap_or_default()),
            "/app/.config/yt-dlp/cookies.txt".to_string(),
            "./cookies.txt".to_string(),
        ];

        for path in candidates {
            if tokio::fs::metadata(&path).await.is_ok() {
                info!("🍪 Cookies encontradas en: {}", path);
                self.cookies = Some(path.into());
                return self;
            }
        }

        debug!("🍪 Sin archivo de cookies");
        self
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify(&self) -> Result<String, StreamError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map_err(|source| StreamError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            error!("❌ {} no responde a --version", self.program);
            return Err(StreamError::ExitStatus {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("✅ yt-dlp versión: {}", version);
        Ok(version)
    }

    fn format_selector(options: &ExtractOptions) -> String {
        match options.bitrate_limit_kbps {
            Some(limit) => format!("{0}[abr<={1}]/{0}", options.format, limit),
            None => options.format.clone(),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "--no-playlist",
            "--quiet",
            "--no-warnings",
            "--socket-timeout",
            "15",
            "--retries",
            "2",
        ]);
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, url: &str, options: &ExtractOptions) -> Result<Extraction, StreamError> {
        let mut cmd = self.base_command();
        let format = Self::format_selector(options);
        cmd.args(["-f", format.as_str(), "-o", "-"]);
        if options.live_mode {
            cmd.args(["--hls-use-mpegts", "--no-part"]);
        }
        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("🎬 Lanzando {} para {}", self.program, url);
        let mut child = cmd.spawn().map_err(|source| StreamError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Decode("stdout no disponible".to_string()))?;

        // Drenar stderr en paralelo para que el proceso nunca se bloquee escribiendo
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if collected.len() < STDERR_LIMIT {
                        collected.extend_from_slice(&buf[..n]);
                    }
                }
                String::from_utf8_lossy(&collected).trim().to_string()
            })
        });

        let program = self.program.clone();
        let exit = async move {
            let status = child.wait().await?;
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };

            if status.success() {
                Ok::<(), StreamError>(())
            } else {
                Err(StreamError::ExitStatus {
                    program,
                    code: status.code(),
                    stderr,
                })
            }
        }
        .boxed();

        Ok(Extraction {
            stdout: Box::new(stdout),
            exit,
        })
    }

    async fn probe(&self, query: &str) -> Result<Track, StreamError> {
        let mut cmd = self.base_command();
        cmd.args(["--dump-single-json", "--skip-download"]);
        cmd.arg(probe_target(query));

        let output = cmd.output().await.map_err(|source| StreamError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("yt-dlp no pudo obtener información de {}: {}", query, stderr);
            return Err(StreamError::ExitStatus {
                program: self.program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        parse_probe_output(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    id: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    entries: Option<Vec<ProbeInfo>>,
}

/// URLs http(s) se pasan tal cual; cualquier otra cosa es una búsqueda
pub fn probe_target(query: &str) -> String {
    let query = query.trim();
    match url::Url::parse(query) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed.to_string(),
        _ => format!("ytsearch1:{}", query),
    }
}

/// Convierte el JSON de `--dump-single-json` en una pista
pub fn parse_probe_output(raw: &[u8]) -> Result<Track, StreamError> {
    let mut info: ProbeInfo =
        serde_json::from_slice(raw).map_err(|e| StreamError::Decode(e.to_string()))?;

    // Las búsquedas devuelven una "playlist" con la primera coincidencia
    let info = match info.entries.take() {
        Some(entries) => entries
            .into_iter()
            .next()
            .ok_or_else(|| StreamError::Decode("la búsqueda no devolvió resultados".to_string()))?,
        None => info,
    };

    let url = info
        .webpage_url
        .or(info.url)
        .ok_or_else(|| StreamError::Decode("la pista no tiene URL".to_string()))?;

    let duration = if info.is_live.unwrap_or(false) {
        0
    } else {
        info.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0)
    };

    let mut track = Track::new(
        info.id.unwrap_or_else(|| url.clone()),
        info.title.unwrap_or_else(|| "Desconocido".to_string()),
        url,
    )
    .with_duration(duration);
    if let Some(thumbnail) = info.thumbnail {
        track = track.with_thumbnail(thumbnail);
    }
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_text_becomes_a_search() {
        assert_eq!(probe_target("  lofi beats "), "ytsearch1:lofi beats");
        assert_eq!(
            probe_target("https://www.youtube.com/watch?v=abc123"),
            "https://www.youtube.com/watch?v=abc123"
        );
        assert_eq!(probe_target("ftp://host/file"), "ytsearch1:ftp://host/file");
    }

    #[test]
    fn parses_single_video() {
        let raw = br#"{
            "id": "abc123",
            "title": "Never Gonna",
            "webpage_url": "https://www.youtube.com/watch?v=abc123",
            "thumbnail": "https://i.ytimg.com/vi/abc123/hq.jpg",
            "duration": 212.6,
            "is_live": false
        }"#;

        let track = parse_probe_output(raw).unwrap();
        assert_eq!(
            track,
            Track::new("abc123", "Never Gonna", "https://www.youtube.com/watch?v=abc123")
                .with_thumbnail("https://i.ytimg.com/vi/abc123/hq.jpg")
                .with_duration(213)
        );
    }

    #[test]
    fn search_results_use_first_entry() {
        let raw = br#"{
            "id": "search",
            "title": "query",
            "entries": [
                { "id": "first", "title": "First", "webpage_url": "https://y/first", "duration": 60 },
                { "id": "second", "title": "Second", "webpage_url": "https://y/second", "duration": 61 }
            ]
        }"#;

        let track = parse_probe_output(raw).unwrap();
        assert_eq!(track.id, "first");
        assert_eq!(track.duration, 60);
    }

    #[test]
    fn live_streams_have_no_duration() {
        let raw = br#"{ "id": "live", "title": "Radio", "url": "https://y/live", "duration": 3600, "is_live": true }"#;
        let track = parse_probe_output(raw).unwrap();
        assert!(track.is_live());
    }

    #[test]
    fn empty_search_is_an_error() {
        let raw = br#"{ "id": "search", "entries": [] }"#;
        assert!(matches!(parse_probe_output(raw), Err(StreamError::Decode(_))));
    }

    #[test]
    fn bitrate_limit_extends_format_selector() {
        let options = ExtractOptions {
            format: "bestaudio".to_string(),
            bitrate_limit_kbps: Some(128),
            live_mode: false,
        };
        assert_eq!(YtDlpExtractor::format_selector(&options), "bestaudio[abr<=128]/bestaudio");
    }
}
