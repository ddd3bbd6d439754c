use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::metadata::{self, TrackMetadata};
use crate::playback::{EndReason, Listener, PlaybackContext, PlaybackEvent, TrackRef};
use crate::service::TrackingService;
use crate::session::SessionCache;
use crate::store::UserId;

#[derive(Debug, Clone, PartialEq)]
pub struct ScrobbleSettings {
    pub min_duration_ms: u64,
    pub min_listen_ratio: f64,
    pub voice_retry_interval: Duration,
    pub voice_retry_attempts: u32,
}

impl Default for ScrobbleSettings {
    fn default() -> Self {
        Self {
            min_duration_ms: 20_000,
            min_listen_ratio: 0.75,
            voice_retry_interval: Duration::from_secs(2),
            voice_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    NowPlaying,
    Scrobble,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReport {
    pub submitted: Vec<UserId>,
    pub revoked: Vec<UserId>,
    pub failed: Vec<UserId>,
    pub skipped: Vec<UserId>,
}

impl SubmissionReport {
    pub fn is_empty(&self) -> bool {
        self.submitted.is_empty()
            && self.revoked.is_empty()
            && self.failed.is_empty()
            && self.skipped.is_empty()
    }
}

pub struct ScrobbleEngine {
    service: Arc<dyn TrackingService>,
    sessions: Arc<SessionCache>,
    settings: ScrobbleSettings,
}

impl ScrobbleEngine {
    pub fn new(
        service: Arc<dyn TrackingService>,
        sessions: Arc<SessionCache>,
        settings: ScrobbleSettings,
    ) -> Self {
        Self {
            service,
            sessions,
            settings,
        }
    }

    pub async fn handle(
        &self,
        player: &dyn PlaybackContext,
        event: PlaybackEvent,
    ) -> SubmissionReport {
        match event {
            PlaybackEvent::TrackStarted { track } => {
                self.submit(player, &track, SubmissionKind::NowPlaying, None)
                    .await
            }
            PlaybackEvent::TrackEnded { track, reason } => {
                if !self.completed_listen(player, &track, &reason) {
                    return SubmissionReport::default();
                }
                let started_at = player.started_at();
                let listeners = player
                    .channel_members()
                    .into_iter()
                    .filter(|member| {
                        let covered = player
                            .dedup()
                            .scrobbled_since(member.user_id, &track.uri, started_at);
                        if covered {
                            debug!(user_id = member.user_id, uri = %track.uri, "already scrobbled on join");
                        }
                        !covered
                    })
                    .collect();
                self.submit(player, &track, SubmissionKind::Scrobble, Some(listeners))
                    .await
            }
            PlaybackEvent::VoiceStateChanged {
                member,
                before,
                after,
            } => {
                if member.is_bot || after.is_none() || before == after {
                    return SubmissionReport::default();
                }
                if player.channel_id() != after {
                    return SubmissionReport::default();
                }
                let Some(track) = player.current_track() else {
                    return SubmissionReport::default();
                };
                if !player
                    .channel_members()
                    .iter()
                    .any(|present| present.user_id == member.user_id)
                {
                    return SubmissionReport::default();
                }
                if track.duration_ms < self.settings.min_duration_ms {
                    return SubmissionReport::default();
                }
                if player
                    .dedup()
                    .is_suppressed(member.user_id, &track.uri, Utc::now())
                {
                    debug!(user_id = member.user_id, uri = %track.uri, "already submitted for this listener");
                    return SubmissionReport::default();
                }
                self.submit(player, &track, SubmissionKind::Scrobble, Some(vec![member]))
                    .await
            }
        }
    }

    fn completed_listen(
        &self,
        player: &dyn PlaybackContext,
        track: &TrackRef,
        reason: &EndReason,
    ) -> bool {
        if *reason != EndReason::Finished {
            return false;
        }
        if track.duration_ms < self.settings.min_duration_ms {
            return false;
        }
        let elapsed_ms = (Utc::now() - player.started_at()).num_milliseconds();
        elapsed_ms as f64 >= track.duration_ms as f64 * self.settings.min_listen_ratio
    }

    async fn submit(
        &self,
        player: &dyn PlaybackContext,
        track: &TrackRef,
        kind: SubmissionKind,
        listeners: Option<Vec<Listener>>,
    ) -> SubmissionReport {
        let mut report = SubmissionReport::default();
        if !track.is_submittable() {
            return report;
        }
        if !self.wait_for_voice(player).await {
            debug!("player voice connection not ready, dropping submission");
            return report;
        }
        let Some(meta) = metadata::resolve(track) else {
            return report;
        };
        let timestamp = Utc::now();

        for listener in listeners.unwrap_or_else(|| player.channel_members()) {
            let user_id = listener.user_id;
            if listener.is_bot {
                continue;
            }
            if listener.is_deafened() {
                report.skipped.push(user_id);
                continue;
            }
            let session = match self.sessions.get(user_id).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(user_id, error = %err, "could not load session");
                    report.failed.push(user_id);
                    continue;
                }
            };
            let Some(session_key) = session.active_session_key() else {
                report.skipped.push(user_id);
                continue;
            };

            let result = match kind {
                SubmissionKind::NowPlaying => {
                    self.service.submit_now_playing(session_key, &meta).await
                }
                SubmissionKind::Scrobble => {
                    self.service
                        .submit_scrobble(session_key, &meta, timestamp)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    let until = suppress_until(&meta);
                    match kind {
                        SubmissionKind::NowPlaying => {
                            player.dedup().record(user_id, &track.uri, until)
                        }
                        SubmissionKind::Scrobble => {
                            player
                                .dedup()
                                .record_scrobble(user_id, &track.uri, until, timestamp)
                        }
                    }
                    info!(user_id, ?kind, artist = %meta.artist, title = %meta.title, "submitted track");
                    report.submitted.push(user_id);
                }
                Err(err) if err.is_session_revoked() => {
                    warn!(user_id, error = %err, "session revoked, clearing stored key");
                    if let Err(err) = self.sessions.revoke(user_id).await {
                        warn!(user_id, error = %err, "could not clear revoked session");
                    }
                    player.dedup().forget(user_id);
                    report.revoked.push(user_id);
                }
                Err(err) => {
                    warn!(user_id, code = ?err.code(), error = %err, "submission failed");
                    report.failed.push(user_id);
                }
            }
        }
        report
    }

    async fn wait_for_voice(&self, player: &dyn PlaybackContext) -> bool {
        for _ in 0..self.settings.voice_retry_attempts {
            if player.bot_voice_connected() {
                return true;
            }
            tokio::time::sleep(self.settings.voice_retry_interval).await;
        }
        player.bot_voice_connected()
    }
}

fn suppress_until(meta: &TrackMetadata) -> chrono::DateTime<Utc> {
    i64::try_from(meta.duration_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|window| Utc::now().checked_add_signed(window))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}
