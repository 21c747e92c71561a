//! Headless HLS "decoder".
//!
//! Polls the live playlist and pulls the newest segment once playback is
//! requested. A fetched segment stands in for a rendered frame. Failures are
//! classified the way a browser decoder reports them: transport problems are
//! network errors, a response that is not a playlist is a media error.

use async_trait::async_trait;
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::controller::{ErrorKind, StreamEvent};
use super::supervisor::{DecoderFactory, EventSender, MediaDecoder};
use crate::error::StreamError;

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeSettings {
    pub poll_interval: Duration,
    /// Consecutive network failures before one is reported as fatal
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            poll_interval: Duration::from_secs(2),
            failure_threshold: 3,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Parsed media playlist
#[derive(Clone, Debug, PartialEq)]
pub struct Playlist {
    pub target_duration: Option<f64>,
    pub segments: Vec<Url>,
    pub ended: bool,
}

/// Parse an m3u8 body. Segment URIs are resolved against `base`.
pub fn parse_playlist(base: &Url, body: &str) -> Result<Playlist, StreamError> {
    let mut lines = body
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(StreamError::Playlist("missing #EXTM3U header".to_string()));
    }

    let mut playlist = Playlist {
        target_duration: None,
        segments: Vec::new(),
        ended: false,
    };

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let duration = value
                .parse::<f64>()
                .map_err(|_| StreamError::Playlist(format!("bad target duration '{}'", value)))?;
            playlist.target_duration = Some(duration);
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if line.starts_with('#') {
            continue;
        } else {
            let segment = base
                .join(line)
                .map_err(|e| StreamError::Playlist(format!("bad segment URI '{}': {}", line, e)))?;
            playlist.segments.push(segment);
        }
    }

    Ok(playlist)
}

pub struct HlsProbeFactory {
    client: reqwest::Client,
    playlist_url: Url,
    settings: ProbeSettings,
}

impl HlsProbeFactory {
    pub fn new(playlist_url: &str, settings: ProbeSettings) -> Result<Self, StreamError> {
        let url = Url::parse(playlist_url).map_err(|e| StreamError::InvalidUrl {
            url: playlist_url.to_string(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("sensor_dashboard_rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(HlsProbeFactory {
            client,
            playlist_url: url,
            settings,
        })
    }

    pub fn playlist_url(&self) -> &Url {
        &self.playlist_url
    }
}

impl DecoderFactory for HlsProbeFactory {
    fn create(&self, events: EventSender) -> Box<dyn MediaDecoder> {
        Box::new(HlsProbe {
            client: self.client.clone(),
            url: self.playlist_url.clone(),
            settings: self.settings.clone(),
            events,
            playing: Arc::new(AtomicBool::new(false)),
            task: None,
        })
    }
}

/// One probe instance; owns at most one background load task
pub struct HlsProbe {
    client: reqwest::Client,
    url: Url,
    settings: ProbeSettings,
    events: EventSender,
    playing: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl HlsProbe {
    fn start_loading(&mut self) {
        self.stop_loading();
        let load = LoadTask {
            client: self.client.clone(),
            url: self.url.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            playing: self.playing.clone(),
        };
        self.task = Some(tokio::spawn(load.run()));
    }

    fn stop_loading(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HlsProbe {
    fn drop(&mut self) {
        self.stop_loading();
    }
}

#[async_trait]
impl MediaDecoder for HlsProbe {
    async fn attach(&mut self) -> Result<(), StreamError> {
        log::info!("[STREAM] Loading playlist {}", self.url);
        self.start_loading();
        Ok(())
    }

    async fn play(&mut self) -> Result<(), StreamError> {
        if self.task.is_none() {
            return Err(StreamError::NotAttached);
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reload_source(&mut self) -> Result<(), StreamError> {
        log::info!("[STREAM] Reloading playlist {}", self.url);
        self.start_loading();
        Ok(())
    }

    async fn recover_media(&mut self) -> Result<(), StreamError> {
        log::info!("[STREAM] Recovering media state");
        self.start_loading();
        Ok(())
    }

    async fn reload_element(&mut self) -> Result<(), StreamError> {
        self.start_loading();
        Ok(())
    }

    async fn destroy(&mut self) {
        self.stop_loading();
        self.playing.store(false, Ordering::SeqCst);
    }
}

enum Failure {
    Network(String),
    Media(String),
}

fn network(e: reqwest::Error) -> Failure {
    Failure::Network(e.to_string())
}

struct LoadTask {
    client: reqwest::Client,
    url: Url,
    settings: ProbeSettings,
    events: EventSender,
    playing: Arc<AtomicBool>,
}

#[derive(Default)]
struct Progress {
    manifest_announced: bool,
    last_segment: Option<Url>,
}

impl LoadTask {
    async fn run(self) {
        let mut progress = Progress::default();
        let mut failures = 0u32;

        loop {
            if self.events.is_closed() {
                return;
            }

            match self.step(&mut progress).await {
                Ok(()) => failures = 0,
                Err(Failure::Network(detail)) => {
                    failures += 1;
                    if failures >= self.settings.failure_threshold.max(1) {
                        self.events.send(StreamEvent::fatal(ErrorKind::Network, detail));
                        return;
                    }
                    log::debug!("[STREAM] Playlist fetch failed ({}): {}", failures, detail);
                    self.events
                        .send(StreamEvent::transient(ErrorKind::Network, detail));
                }
                Err(Failure::Media(detail)) => {
                    self.events.send(StreamEvent::fatal(ErrorKind::Media, detail));
                    return;
                }
            }

            sleep(self.settings.poll_interval).await;
        }
    }

    async fn step(&self, progress: &mut Progress) -> Result<(), Failure> {
        let body = self.get(&self.url).await?.text().await.map_err(network)?;
        let playlist =
            parse_playlist(&self.url, &body).map_err(|e| Failure::Media(e.to_string()))?;

        if !progress.manifest_announced {
            progress.manifest_announced = true;
            self.events.send(StreamEvent::ManifestParsed);
        }

        if !self.playing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(segment) = playlist.segments.last() else {
            return Ok(());
        };
        if progress.last_segment.as_ref() == Some(segment) {
            return Ok(());
        }

        let bytes = self.get(segment).await?.bytes().await.map_err(network)?;
        if bytes.is_empty() {
            return Err(Failure::Media(format!("empty segment {}", segment)));
        }
        progress.last_segment = Some(segment.clone());
        self.events.send(StreamEvent::FrameRendered);
        Ok(())
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, Failure> {
        let response = self.client.get(url.clone()).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Failure::Network(format!("HTTP {} for {}", status.as_u16(), url)));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::supervisor::Envelope;
    use axum::routing::get;
    use axum::Router;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const LIVE: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:2.0,\nseg7.ts\n#EXTINF:2.0,\nseg8.ts\n";

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast() -> ProbeSettings {
        ProbeSettings {
            poll_interval: Duration::from_millis(20),
            failure_threshold: 2,
            timeout: Duration::from_secs(2),
        }
    }

    fn probe(url: &str) -> (Box<dyn MediaDecoder>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = HlsProbeFactory::new(url, fast()).unwrap();
        (factory.create(EventSender::new(4, tx)), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> StreamEvent {
        let envelope = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.generation, Some(4));
        envelope.event
    }

    #[test]
    fn test_parse_live_playlist() {
        let base = Url::parse("http://cam.local:8080/hls/live.m3u8").unwrap();
        let playlist = parse_playlist(&base, LIVE).unwrap();
        assert_eq!(playlist.target_duration, Some(2.0));
        assert!(!playlist.ended);
        assert_eq!(
            playlist.segments.last().map(Url::as_str),
            Some("http://cam.local:8080/hls/seg8.ts")
        );
    }

    #[test]
    fn test_parse_absolute_segment_and_endlist() {
        let base = Url::parse("http://cam.local/hls/live.m3u8").unwrap();
        let body = "\u{feff}#EXTM3U\n#EXTINF:1.0,\nhttp://cdn.local/a.ts\n#EXT-X-ENDLIST\n";
        let playlist = parse_playlist(&base, body).unwrap();
        assert!(playlist.ended);
        assert_eq!(playlist.segments[0].as_str(), "http://cdn.local/a.ts");
    }

    #[test]
    fn test_parse_rejects_non_playlist() {
        let base = Url::parse("http://cam.local/hls/live.m3u8").unwrap();
        assert!(matches!(
            parse_playlist(&base, "<html>502 Bad Gateway</html>"),
            Err(StreamError::Playlist(_))
        ));
        assert!(matches!(
            parse_playlist(&base, "#EXTM3U\n#EXT-X-TARGETDURATION:abc\n"),
            Err(StreamError::Playlist(_))
        ));
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        assert!(matches!(
            HlsProbeFactory::new("not a url", ProbeSettings::default()),
            Err(StreamError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_manifest_then_frame_after_play() {
        let app = Router::new()
            .route("/hls/live.m3u8", get(|| async { LIVE }))
            .route("/hls/seg8.ts", get(|| async { vec![0x47u8; 188] }));
        let base = serve(app).await;
        let (mut decoder, mut rx) = probe(&format!("{}/hls/live.m3u8", base));

        decoder.attach().await.unwrap();
        assert_eq!(next(&mut rx).await, StreamEvent::ManifestParsed);

        decoder.play().await.unwrap();
        assert_eq!(next(&mut rx).await, StreamEvent::FrameRendered);
        decoder.destroy().await;
    }

    #[tokio::test]
    async fn test_garbage_playlist_is_fatal_media() {
        let app = Router::new().route("/live.m3u8", get(|| async { "<html>oops</html>" }));
        let base = serve(app).await;
        let (mut decoder, mut rx) = probe(&format!("{}/live.m3u8", base));

        decoder.attach().await.unwrap();
        match next(&mut rx).await {
            StreamEvent::Error { kind, fatal, .. } => {
                assert_eq!(kind, ErrorKind::Media);
                assert!(fatal);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_escalates_to_fatal_network() {
        let (mut decoder, mut rx) = probe("http://127.0.0.1:9/live.m3u8");
        decoder.attach().await.unwrap();

        assert!(matches!(
            next(&mut rx).await,
            StreamEvent::Error {
                kind: ErrorKind::Network,
                fatal: false,
                ..
            }
        ));
        assert!(matches!(
            next(&mut rx).await,
            StreamEvent::Error {
                kind: ErrorKind::Network,
                fatal: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_play_before_attach_fails() {
        let (mut decoder, _rx) = probe("http://127.0.0.1:9/live.m3u8");
        assert_eq!(decoder.play().await, Err(StreamError::NotAttached));
    }
}
