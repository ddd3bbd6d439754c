use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::ServiceError;
use crate::metadata::TrackMetadata;
use crate::playback::{ChannelId, DedupTable, Listener, PlaybackContext, TrackRef};
use crate::service::{TokenExchange, TrackingService, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    NowPlaying,
    Scrobble,
}

#[derive(Debug, Clone)]
pub struct SubmissionCall {
    pub kind: CallKind,
    pub session_key: String,
    pub track: TrackMetadata,
}

/// Tracking service double that replays queued outcomes and records calls.
#[derive(Default)]
pub struct ScriptedService {
    tokens: AtomicUsize,
    token_failure: Mutex<Option<ServiceError>>,
    exchanges: Mutex<VecDeque<Result<TokenExchange, ServiceError>>>,
    exchange_calls: AtomicUsize,
    exchange_gate: Mutex<Option<Arc<Notify>>>,
    submit_failures: DashMap<String, ServiceError>,
    submissions: Mutex<Vec<SubmissionCall>>,
    profiles: DashMap<String, UserProfile>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exchange(&self, outcome: Result<TokenExchange, ServiceError>) {
        self.exchanges.lock().unwrap().push_back(outcome);
    }

    pub fn fail_token_requests(&self, err: ServiceError) {
        *self.token_failure.lock().unwrap() = Some(err);
    }

    /// Makes every exchange block until the returned gate is notified.
    pub fn gate_exchanges(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.exchange_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_submissions_for(&self, session_key: &str, err: ServiceError) {
        self.submit_failures.insert(session_key.to_string(), err);
    }

    pub fn set_profile(&self, session_key: &str, profile: UserProfile) {
        self.profiles.insert(session_key.to_string(), profile);
    }

    pub fn tokens_issued(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<SubmissionCall> {
        self.submissions.lock().unwrap().clone()
    }

    fn submit(
        &self,
        kind: CallKind,
        session_key: &str,
        track: &TrackMetadata,
    ) -> Result<(), ServiceError> {
        if let Some(err) = self.submit_failures.get(session_key) {
            return Err(err.clone());
        }
        self.submissions.lock().unwrap().push(SubmissionCall {
            kind,
            session_key: session_key.to_string(),
            track: track.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl TrackingService for ScriptedService {
    async fn request_token(&self) -> Result<String, ServiceError> {
        if let Some(err) = self.token_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let issued = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{issued}"))
    }

    fn authorization_url(&self, token: &str) -> String {
        format!("https://auth.test/?api_key=key&token={token}")
    }

    async fn exchange_token(&self, _token: &str) -> Result<TokenExchange, ServiceError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.exchange_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.exchanges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TokenExchange::Pending))
    }

    async fn submit_now_playing(
        &self,
        session_key: &str,
        track: &TrackMetadata,
    ) -> Result<(), ServiceError> {
        self.submit(CallKind::NowPlaying, session_key, track)
    }

    async fn submit_scrobble(
        &self,
        session_key: &str,
        track: &TrackMetadata,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.submit(CallKind::Scrobble, session_key, track)
    }

    async fn fetch_user_info(&self, session_key: &str) -> Result<UserProfile, ServiceError> {
        if let Some(err) = self.submit_failures.get(session_key) {
            return Err(err.clone());
        }
        self.profiles
            .get(session_key)
            .map(|profile| profile.clone())
            .ok_or_else(|| ServiceError::Api {
                code: 6,
                message: "User not found".to_string(),
            })
    }
}

/// Player double with directly adjustable state.
pub struct TestPlayer {
    pub current: Mutex<Option<TrackRef>>,
    pub started_at: Mutex<DateTime<Utc>>,
    pub channel: Option<ChannelId>,
    pub members: Mutex<Vec<Listener>>,
    pub voice_connected: Mutex<bool>,
    pub dedup: DedupTable,
}

impl TestPlayer {
    pub fn new(channel: ChannelId, members: Vec<Listener>) -> Self {
        Self {
            current: Mutex::new(None),
            started_at: Mutex::new(Utc::now()),
            channel: Some(channel),
            members: Mutex::new(members),
            voice_connected: Mutex::new(true),
            dedup: DedupTable::new(),
        }
    }

    pub fn play(&self, track: TrackRef, elapsed: chrono::Duration) {
        *self.current.lock().unwrap() = Some(track);
        *self.started_at.lock().unwrap() = Utc::now() - elapsed;
    }

    pub fn set_voice_connected(&self, connected: bool) {
        *self.voice_connected.lock().unwrap() = connected;
    }
}

impl PlaybackContext for TestPlayer {
    fn current_track(&self) -> Option<TrackRef> {
        self.current.lock().unwrap().clone()
    }

    fn started_at(&self) -> DateTime<Utc> {
        *self.started_at.lock().unwrap()
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.channel
    }

    fn channel_members(&self) -> Vec<Listener> {
        self.members.lock().unwrap().clone()
    }

    fn bot_voice_connected(&self) -> bool {
        *self.voice_connected.lock().unwrap()
    }

    fn dedup(&self) -> &DedupTable {
        &self.dedup
    }
}

pub fn listener(user_id: u64) -> Listener {
    Listener {
        user_id,
        ..Default::default()
    }
}

pub fn catalog_track(uri: &str, duration_ms: u64) -> TrackRef {
    TrackRef {
        source_name: "spotify".to_string(),
        title: "Track Z".to_string(),
        single_title: "Track Z".to_string(),
        author: "Artist".to_string(),
        duration_ms,
        uri: uri.to_string(),
        ..Default::default()
    }
}
