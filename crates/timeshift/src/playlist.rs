// Playlist client: fetches upstream HLS playlists and maps them into a
// closed summary type. Variant selection policy lives with the caller.

use m3u8_rs::parse_playlist_res;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::PlaylistConfig;
use crate::error::{Result, TimeShiftError};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

const HLS_MIME: &str = "application/vnd.apple.mpegurl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
}

#[derive(Debug, Clone)]
pub struct UpstreamSegment {
    pub uri: String,
    /// Declared `#EXTINF` duration in seconds.
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub struct UpstreamVariant {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
}

/// Parsed view of one upstream playlist.
#[derive(Debug, Clone)]
pub struct UpstreamPlaylist {
    pub kind: PlaylistKind,
    /// `#EXT-X-MEDIA-SEQUENCE`; zero for master playlists.
    pub media_sequence: u64,
    /// `#EXT-X-TARGETDURATION` in seconds; zero for master playlists.
    pub target_duration: u64,
    pub segments: Vec<UpstreamSegment>,
    pub variants: Vec<UpstreamVariant>,
    pub end_list: bool,
}

impl UpstreamPlaylist {
    pub fn is_master(&self) -> bool {
        self.kind == PlaylistKind::Master
    }
}

pub struct PlaylistClient {
    client: reqwest::Client,
    config: PlaylistConfig,
}

impl PlaylistClient {
    pub fn new(client: reqwest::Client, config: PlaylistConfig) -> Self {
        Self { client, config }
    }

    /// Fetch a playlist body, retrying transient failures at a fixed delay.
    pub async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<String> {
        let policy = RetryPolicy::fixed(self.config.fetch_retries, self.config.fetch_retry_delay);

        retry_with_backoff(&policy, token, |_attempt| async {
            let response = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return RetryAction::Fail(TimeShiftError::Cancelled);
                }
                response = self
                    .client
                    .get(url.clone())
                    .header(ACCEPT, HLS_MIME)
                    .timeout(self.config.fetch_timeout)
                    .send() => response,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    return if crate::error::is_retryable_reqwest_error(&e) {
                        RetryAction::Retry(e.into())
                    } else {
                        RetryAction::Fail(e.into())
                    };
                }
            };

            let status = response.status();
            if !status.is_success() {
                let err = TimeShiftError::HttpStatus {
                    status,
                    url: url.to_string(),
                };
                return if crate::error::is_retryable_status(status) {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }

            match response.text().await {
                Ok(text) => RetryAction::Success(text),
                Err(e) => RetryAction::Retry(e.into()),
            }
        })
        .await
    }

    /// Parse a playlist body. Master and media playlists both succeed; the
    /// caller inspects `kind`.
    pub fn parse(text: &str) -> Result<UpstreamPlaylist> {
        match parse_playlist_res(text.as_bytes()) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => Ok(UpstreamPlaylist {
                kind: PlaylistKind::Master,
                media_sequence: 0,
                target_duration: 0,
                segments: Vec::new(),
                variants: master
                    .variants
                    .into_iter()
                    .map(|v| UpstreamVariant {
                        uri: v.uri,
                        bandwidth: v.bandwidth,
                        resolution: v.resolution.map(|r| format!("{}x{}", r.width, r.height)),
                        codecs: v.codecs,
                    })
                    .collect(),
                end_list: false,
            }),
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => Ok(UpstreamPlaylist {
                kind: PlaylistKind::Media,
                media_sequence: media.media_sequence,
                target_duration: media.target_duration,
                segments: media
                    .segments
                    .iter()
                    .map(|s| UpstreamSegment {
                        uri: s.uri.clone(),
                        duration: s.duration as f64,
                    })
                    .collect(),
                variants: Vec::new(),
                end_list: media.end_list,
            }),
            Err(e) => Err(TimeShiftError::playlist(format!(
                "failed to parse playlist: {e}"
            ))),
        }
    }

    /// Fetch and parse in one step.
    pub async fn fetch_playlist(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<UpstreamPlaylist> {
        let text = self.fetch(url, token).await?;
        trace!(url = %url, bytes = text.len(), "Fetched playlist");
        Self::parse(&text)
    }

    /// Resolve the playlist's references against `base`: variant URIs for a
    /// master playlist, segment URIs for a media playlist. Unresolvable
    /// URIs are skipped with a warning.
    pub fn segment_urls(playlist: &UpstreamPlaylist, base: &Url) -> Vec<Url> {
        let uris: Vec<&str> = match playlist.kind {
            PlaylistKind::Master => playlist.variants.iter().map(|v| v.uri.as_str()).collect(),
            PlaylistKind::Media => playlist.segments.iter().map(|s| s.uri.as_str()).collect(),
        };
        uris.into_iter()
            .filter_map(|uri| match resolve_uri(base, uri) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(uri, error = %e, "Skipping unresolvable URI");
                    None
                }
            })
            .collect()
    }
}

/// Join a possibly-relative URI against a base URL.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<Url> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Url::parse(uri).map_err(|e| TimeShiftError::invalid_url(uri, e.to_string()));
    }
    let resolved = base
        .join(uri)
        .map_err(|e| TimeShiftError::invalid_url(uri, e.to_string()))?;
    debug!(base = %base, uri, resolved = %resolved, "Resolved URI");
    Ok(resolved)
}
