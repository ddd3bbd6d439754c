use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::playback::{
    ChannelId, DedupTable, EndReason, Listener, PlaybackContext, PlaybackEvent, TrackRef,
};
use crate::scrobble::{ScrobbleEngine, SubmissionReport};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordedEvent {
    TrackStarted {
        track: TrackRef,
    },
    TrackEnded {
        track: TrackRef,
        reason: String,
        elapsed_ms: u64,
    },
    VoiceStateChanged {
        member: Listener,
        #[serde(default)]
        before: Option<ChannelId>,
        #[serde(default)]
        after: Option<ChannelId>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedSession {
    pub channel_id: ChannelId,
    #[serde(default = "default_connected")]
    pub bot_voice_connected: bool,
    #[serde(default)]
    pub members: Vec<Listener>,
    pub events: Vec<RecordedEvent>,
}

fn default_connected() -> bool {
    true
}

pub fn load_session(path: &Path) -> Result<RecordedSession> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading events at {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing events at {}", path.display()))
}

pub struct ReplayPlayer {
    channel_id: ChannelId,
    bot_voice_connected: bool,
    members: Vec<Listener>,
    current: Option<TrackRef>,
    started_at: DateTime<Utc>,
    dedup: DedupTable,
}

impl ReplayPlayer {
    pub fn new(session: &RecordedSession) -> Self {
        Self {
            channel_id: session.channel_id,
            bot_voice_connected: session.bot_voice_connected,
            members: session.members.clone(),
            current: None,
            started_at: Utc::now(),
            dedup: DedupTable::new(),
        }
    }

    fn join(&mut self, member: &Listener) {
        self.members.retain(|present| present.user_id != member.user_id);
        self.members.push(member.clone());
    }

    fn leave(&mut self, user_id: u64) {
        self.members.retain(|present| present.user_id != user_id);
    }
}

impl PlaybackContext for ReplayPlayer {
    fn current_track(&self) -> Option<TrackRef> {
        self.current.clone()
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn channel_id(&self) -> Option<ChannelId> {
        Some(self.channel_id)
    }

    fn channel_members(&self) -> Vec<Listener> {
        self.members.clone()
    }

    fn bot_voice_connected(&self) -> bool {
        self.bot_voice_connected
    }

    fn dedup(&self) -> &DedupTable {
        &self.dedup
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub submitted: usize,
    pub revoked: usize,
    pub failed: usize,
}

impl ReplaySummary {
    fn add(&mut self, report: &SubmissionReport) {
        self.events += 1;
        self.submitted += report.submitted.len();
        self.revoked += report.revoked.len();
        self.failed += report.failed.len();
    }
}

pub async fn replay(engine: &ScrobbleEngine, session: RecordedSession) -> ReplaySummary {
    let mut player = ReplayPlayer::new(&session);
    let mut summary = ReplaySummary::default();

    for recorded in session.events {
        let event = match recorded {
            RecordedEvent::TrackStarted { track } => {
                player.current = Some(track.clone());
                player.started_at = Utc::now();
                PlaybackEvent::TrackStarted { track }
            }
            RecordedEvent::TrackEnded {
                track,
                reason,
                elapsed_ms,
            } => {
                let elapsed =
                    chrono::Duration::milliseconds(i64::try_from(elapsed_ms).unwrap_or(i64::MAX));
                let now = Utc::now();
                player.started_at = now.checked_sub_signed(elapsed).unwrap_or(DateTime::<Utc>::MIN_UTC);
                PlaybackEvent::TrackEnded {
                    track,
                    reason: EndReason::parse(&reason),
                }
            }
            RecordedEvent::VoiceStateChanged {
                member,
                before,
                after,
            } => {
                if after == Some(player.channel_id) {
                    player.join(&member);
                } else if before == Some(player.channel_id) {
                    player.leave(member.user_id);
                }
                PlaybackEvent::VoiceStateChanged {
                    member,
                    before,
                    after,
                }
            }
        };
        let ended = matches!(event, PlaybackEvent::TrackEnded { .. });
        let report = engine.handle(&player, event).await;
        debug!(?report, "replayed event");
        summary.add(&report);
        if ended {
            player.current = None;
        }
    }
    summary
}
