// Playlist generator: on every listener request, anchors a window of cached
// segments at (now - delay) and renders a media playlist.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::SegmentCache;
use crate::config::GeneratorConfig;
use crate::now_ms;

/// A minimal valid MPEG-TS packet: one 188-byte packet, sync byte 0x47,
/// zeros elsewhere. Served at `/stream/unavailable.ts` so clients have
/// something to poll while the buffer warms.
pub const UNAVAILABLE_SEGMENT: [u8; 188] = {
    let mut packet = [0u8; 188];
    packet[0] = 0x47;
    packet
};

/// Per-request overrides for playlist generation.
#[derive(Debug, Clone, Default)]
pub struct PlaylistRequest {
    pub window_count: Option<usize>,
    pub time_shift: Option<Duration>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSegment {
    pub duration: f64,
    pub uri: String,
    pub sequence_number: u64,
}

/// Rendered playlist plus its structured view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPlaylist {
    pub m3u8_content: String,
    pub segments: Vec<PlaylistSegment>,
    pub media_sequence: u64,
    pub target_duration: u64,
}

impl GeneratedPlaylist {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

pub struct PlaylistGenerator {
    cache: Arc<SegmentCache>,
    config: GeneratorConfig,
    /// Default time shift; requests may override.
    delay: Duration,
}

impl PlaylistGenerator {
    pub fn new(cache: Arc<SegmentCache>, config: GeneratorConfig, delay: Duration) -> Self {
        Self {
            cache,
            config,
            delay,
        }
    }

    /// Generate a playlist anchored at the current wall time.
    pub fn generate(&self, request: &PlaylistRequest) -> GeneratedPlaylist {
        self.generate_at(now_ms(), request)
    }

    /// Generate with an explicit notion of "now". Pure over a fixed cache
    /// state; `generate` is the wall-clock wrapper.
    pub fn generate_at(&self, now: i64, request: &PlaylistRequest) -> GeneratedPlaylist {
        let window_count = request
            .window_count
            .unwrap_or(self.config.window_count)
            .max(1);
        let time_shift = request.time_shift.unwrap_or(self.delay);
        let base_url = request
            .base_url
            .as_deref()
            .unwrap_or(&self.config.base_url);

        let target_time = now - time_shift.as_millis() as i64;
        let Some(anchor) = self.cache.get_at(target_time) else {
            return self.empty_playlist(base_url);
        };

        let (lo, hi) = self.select_window(anchor.metadata.sequence_number, window_count);
        let segments: Vec<PlaylistSegment> = (lo..=hi)
            .filter_map(|seq| self.cache.get_meta(seq))
            .map(|segment| PlaylistSegment {
                duration: segment.metadata.duration,
                uri: format!(
                    "{base_url}/stream/segment/{}.ts",
                    segment.metadata.sequence_number
                ),
                sequence_number: segment.metadata.sequence_number,
            })
            .collect();

        if segments.is_empty() {
            return self.empty_playlist(base_url);
        }

        let media_sequence = segments[0].sequence_number;
        let target_duration = segments
            .iter()
            .map(|s| s.duration)
            .fold(0.0f64, f64::max)
            .ceil() as u64;
        let target_duration = if target_duration == 0 {
            self.config.target_duration_fallback
        } else {
            target_duration
        };

        GeneratedPlaylist {
            m3u8_content: render(target_duration, media_sequence, &segments),
            segments,
            media_sequence,
            target_duration,
        }
    }

    /// Choose the window bounds around the anchor.
    ///
    /// The window starts centred on the anchor and grows only across
    /// sequences actually present in the cache: a missing preceding side is
    /// compensated by expanding forward, a short forward side by expanding
    /// backward. The result is always sequence-contiguous.
    fn select_window(&self, anchor: u64, window_count: usize) -> (u64, u64) {
        let half = (window_count / 2) as u64;
        let target_lo = anchor.saturating_sub(half);

        let mut lo = anchor;
        let mut hi = anchor;
        while lo > target_lo && lo > 0 && self.cache.contains_sequence(lo - 1) {
            lo -= 1;
        }
        let len = |lo: u64, hi: u64| (hi - lo + 1) as usize;
        while len(lo, hi) < window_count && self.cache.contains_sequence(hi + 1) {
            hi += 1;
        }
        while len(lo, hi) < window_count && lo > 0 && self.cache.contains_sequence(lo - 1) {
            lo -= 1;
        }
        (lo, hi)
    }

    fn empty_playlist(&self, base_url: &str) -> GeneratedPlaylist {
        let target_duration = self.config.target_duration_fallback;
        let mut m3u8 = String::new();
        let _ = write!(
            m3u8,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:{target_duration}\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-DISCONTINUITY\n\
             #EXTINF:{target_duration}.000,\n\
             {base_url}/stream/unavailable.ts\n"
        );
        GeneratedPlaylist {
            m3u8_content: m3u8,
            segments: Vec::new(),
            media_sequence: 0,
            target_duration,
        }
    }
}

fn render(target_duration: u64, media_sequence: u64, segments: &[PlaylistSegment]) -> String {
    let mut m3u8 = String::with_capacity(128 + segments.len() * 64);
    let _ = write!(
        m3u8,
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-TARGETDURATION:{target_duration}\n\
         #EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
    );
    for segment in segments {
        let _ = write!(m3u8, "#EXTINF:{:.3},\n{}\n", segment.duration, segment.uri);
    }
    m3u8
}
