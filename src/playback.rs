use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::store::UserId;

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    YouTube,
    SoundCloud,
    Spotify,
    Deezer,
    AppleMusic,
    Tidal,
    Local,
    Http,
    Other,
}

impl TrackSource {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "youtube" => TrackSource::YouTube,
            "soundcloud" => TrackSource::SoundCloud,
            "spotify" => TrackSource::Spotify,
            "deezer" => TrackSource::Deezer,
            "applemusic" => TrackSource::AppleMusic,
            "tidal" => TrackSource::Tidal,
            "local" => TrackSource::Local,
            "http" => TrackSource::Http,
            _ => TrackSource::Other,
        }
    }

    pub fn is_video_platform(self) -> bool {
        matches!(self, TrackSource::YouTube | TrackSource::SoundCloud)
    }

    pub fn is_full_catalog(self) -> bool {
        matches!(
            self,
            TrackSource::Spotify | TrackSource::Deezer | TrackSource::AppleMusic | TrackSource::Tidal
        )
    }

    pub fn is_unattributable(self) -> bool {
        matches!(self, TrackSource::Local | TrackSource::Http)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackRef {
    pub source_name: String,
    pub title: String,
    /// Title with any artist prefix already removed by the resolver upstream.
    pub single_title: String,
    pub author: String,
    pub album: Option<String>,
    pub duration_ms: u64,
    pub is_stream: bool,
    /// Platform-native id; absent when the track was matched from a search.
    pub native_id: Option<String>,
    pub uri: String,
    /// Queued by autoplay/radio rather than by a listener.
    pub autoplay: bool,
}

impl TrackRef {
    pub fn source(&self) -> TrackSource {
        TrackSource::parse(&self.source_name)
    }

    pub fn is_submittable(&self) -> bool {
        !self.is_stream && !self.source().is_unattributable()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Listener {
    pub user_id: UserId,
    pub is_bot: bool,
    pub self_deaf: bool,
    pub deaf: bool,
}

impl Listener {
    pub fn is_deafened(&self) -> bool {
        self.self_deaf || self.deaf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Finished,
    Stopped,
    Replaced,
    LoadFailed,
    Cleanup,
    Other(String),
}

impl EndReason {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "FINISHED" => EndReason::Finished,
            "STOPPED" => EndReason::Stopped,
            "REPLACED" => EndReason::Replaced,
            "LOAD_FAILED" => EndReason::LoadFailed,
            "CLEANUP" => EndReason::Cleanup,
            _ => EndReason::Other(value.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    TrackStarted {
        track: TrackRef,
    },
    TrackEnded {
        track: TrackRef,
        reason: EndReason,
    },
    VoiceStateChanged {
        member: Listener,
        before: Option<ChannelId>,
        after: Option<ChannelId>,
    },
}

pub trait PlaybackContext: Send + Sync {
    fn current_track(&self) -> Option<TrackRef>;
    fn started_at(&self) -> DateTime<Utc>;
    fn channel_id(&self) -> Option<ChannelId>;
    fn channel_members(&self) -> Vec<Listener>;
    fn bot_voice_connected(&self) -> bool;
    fn dedup(&self) -> &DedupTable;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub last_track_uri: String,
    pub suppress_until: DateTime<Utc>,
    pub scrobbled_at: Option<DateTime<Utc>>,
}

/// Last successful submission per listener within one player.
#[derive(Debug, Default)]
pub struct DedupTable {
    records: DashMap<UserId, DedupRecord>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: UserId, track_uri: &str, suppress_until: DateTime<Utc>) {
        self.records.insert(
            user_id,
            DedupRecord {
                last_track_uri: track_uri.to_string(),
                suppress_until,
                scrobbled_at: None,
            },
        );
    }

    pub fn record_scrobble(
        &self,
        user_id: UserId,
        track_uri: &str,
        suppress_until: DateTime<Utc>,
        scrobbled_at: DateTime<Utc>,
    ) {
        self.records.insert(
            user_id,
            DedupRecord {
                last_track_uri: track_uri.to_string(),
                suppress_until,
                scrobbled_at: Some(scrobbled_at),
            },
        );
    }

    pub fn forget(&self, user_id: UserId) {
        self.records.remove(&user_id);
    }

    pub fn get(&self, user_id: UserId) -> Option<DedupRecord> {
        self.records.get(&user_id).map(|entry| entry.clone())
    }

    pub fn is_suppressed(&self, user_id: UserId, track_uri: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(&user_id)
            .is_some_and(|record| record.last_track_uri == track_uri && now < record.suppress_until)
    }

    pub fn scrobbled_since(
        &self,
        user_id: UserId,
        track_uri: &str,
        since: DateTime<Utc>,
    ) -> bool {
        self.records.get(&user_id).is_some_and(|record| {
            record.last_track_uri == track_uri
                && record.scrobbled_at.is_some_and(|at| at >= since)
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn local_http_and_streams_are_not_submittable() {
        let track = TrackRef {
            source_name: "youtube".to_string(),
            ..Default::default()
        };
        assert!(track.is_submittable());

        for source in ["local", "http", "HTTP"] {
            let track = TrackRef {
                source_name: source.to_string(),
                ..Default::default()
            };
            assert!(!track.is_submittable(), "{source}");
        }

        let stream = TrackRef {
            source_name: "youtube".to_string(),
            is_stream: true,
            ..Default::default()
        };
        assert!(!stream.is_submittable());
    }

    #[test]
    fn end_reason_parses_engine_names() {
        assert_eq!(EndReason::parse("FINISHED"), EndReason::Finished);
        assert_eq!(EndReason::parse("finished"), EndReason::Finished);
        assert_eq!(EndReason::parse("LOAD_FAILED"), EndReason::LoadFailed);
        assert_eq!(
            EndReason::parse("weird"),
            EndReason::Other("weird".to_string())
        );
    }

    #[test]
    fn dedup_suppresses_same_track_until_deadline() {
        let table = DedupTable::new();
        let now = Utc::now();
        table.record(1, "https://example.com/a", now + Duration::seconds(180));

        assert!(table.is_suppressed(1, "https://example.com/a", now));
        assert!(!table.is_suppressed(1, "https://example.com/b", now));
        assert!(!table.is_suppressed(2, "https://example.com/a", now));
        assert!(!table.is_suppressed(
            1,
            "https://example.com/a",
            now + Duration::seconds(181)
        ));

        table.forget(1);
        assert!(table.is_empty());
    }

    #[test]
    fn scrobble_marks_only_the_current_play() {
        let table = DedupTable::new();
        let started = Utc::now();
        let uri = "spotify:track:a";

        table.record(1, uri, started + Duration::seconds(180));
        assert!(!table.scrobbled_since(1, uri, started));

        let until = started + Duration::seconds(180);
        table.record_scrobble(1, uri, until, started + Duration::seconds(30));
        assert!(table.scrobbled_since(1, uri, started));
        assert!(!table.scrobbled_since(1, "spotify:track:b", started));
        assert!(!table.scrobbled_since(1, uri, started + Duration::seconds(200)));
    }
}
