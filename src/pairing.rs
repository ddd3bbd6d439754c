use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{PairingError, ServiceError};
use crate::service::{SessionGrant, TokenExchange, TrackingService};
use crate::session::SessionCache;
use crate::store::UserId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairingState {
    #[default]
    Idle,
    AwaitingAuthorization,
    Polling,
    Linked,
    Unlinked,
    Expired,
    Failed,
}

impl PairingState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PairingState::AwaitingAuthorization | PairingState::Polling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingState::Linked
                | PairingState::Unlinked
                | PairingState::Expired
                | PairingState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub link_ttl: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            max_attempts: 15,
            link_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairingRequest {
    pub state: PairingState,
    pub request_token: String,
    pub authorization_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub poll_attempts_remaining: u32,
    pub session_key: Option<String>,
    pub username: Option<String>,
    pub error: Option<PairingError>,
}

struct PollRun {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PollRun {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

pub struct PairingFlow {
    user_id: UserId,
    service: Arc<dyn TrackingService>,
    sessions: Arc<SessionCache>,
    settings: PairingSettings,
    request: watch::Sender<PairingRequest>,
    run: Mutex<Option<PollRun>>,
    commit: Mutex<()>,
}

impl PairingFlow {
    pub fn new(
        user_id: UserId,
        service: Arc<dyn TrackingService>,
        sessions: Arc<SessionCache>,
        settings: PairingSettings,
    ) -> Arc<Self> {
        let (request, _) = watch::channel(PairingRequest::default());
        Arc::new(Self {
            user_id,
            service,
            sessions,
            settings,
            request,
            run: Mutex::new(None),
            commit: Mutex::new(()),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn snapshot(&self) -> PairingRequest {
        self.request.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingRequest> {
        self.request.subscribe()
    }

    pub async fn start_linking(self: &Arc<Self>) -> Result<PairingRequest, PairingError> {
        let mut run = self.run.lock().await;
        let current = self.snapshot();
        if current.state.is_active() && !current.authorization_url.is_empty() {
            debug!(user_id = self.user_id, "reusing in-flight authorization link");
            return Ok(current);
        }
        if let Some(previous) = run.take() {
            previous.cancel();
        }

        let token = match self.service.request_token().await {
            Ok(token) => token,
            Err(err) => {
                error!(user_id = self.user_id, error = %err, "failed requesting pairing token");
                let failure = PairingError::Failed(err);
                self.request.send_replace(PairingRequest {
                    state: PairingState::Failed,
                    error: Some(failure.clone()),
                    ..Default::default()
                });
                return Err(failure);
            }
        };

        let request = PairingRequest {
            state: PairingState::AwaitingAuthorization,
            authorization_url: self.service.authorization_url(&token),
            request_token: token.clone(),
            expires_at: deadline(self.settings.link_ttl),
            poll_attempts_remaining: self.settings.max_attempts,
            ..Default::default()
        };
        self.request.send_replace(request.clone());

        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Arc::clone(self).poll(token, Arc::clone(&cancelled)));
        *run = Some(PollRun { cancelled, handle });
        info!(user_id = self.user_id, "issued authorization link");
        Ok(request)
    }

    pub async fn unlink(&self) -> Result<PairingRequest, PairingError> {
        let _commit = self.commit.lock().await;
        if let Some(run) = self.run.lock().await.take() {
            run.cancel();
        }
        if let Err(err) = self.sessions.unlink(self.user_id).await {
            let failure = PairingError::Store(err);
            self.request.send_replace(PairingRequest {
                state: PairingState::Failed,
                error: Some(failure.clone()),
                ..Default::default()
            });
            return Err(failure);
        }
        let request = PairingRequest {
            state: PairingState::Unlinked,
            ..Default::default()
        };
        self.request.send_replace(request.clone());
        info!(user_id = self.user_id, "unlinked tracking account");
        Ok(request)
    }

    /// Resolves once the flow reaches a terminal state.
    pub async fn wait(&self) -> Result<PairingRequest, PairingError> {
        let mut updates = self.request.subscribe();
        let request = match updates
            .wait_for(|request| request.state == PairingState::Idle || request.state.is_terminal())
            .await
        {
            Ok(request) => request.clone(),
            Err(_) => self.snapshot(),
        };
        if let Some(err) = request.error.clone() {
            return Err(err);
        }
        Ok(request)
    }

    async fn poll(self: Arc<Self>, token: String, cancelled: Arc<AtomicBool>) {
        let mut remaining = self.settings.max_attempts;
        while remaining > 0 {
            tokio::time::sleep(self.settings.poll_interval).await;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            self.update(&cancelled, |request| request.state = PairingState::Polling);

            match self.service.exchange_token(&token).await {
                Ok(TokenExchange::Authorized(grant)) => {
                    self.commit(grant, &cancelled).await;
                    return;
                }
                Ok(TokenExchange::Pending) => {}
                Err(err @ ServiceError::Api { .. }) => {
                    debug!(user_id = self.user_id, error = %err, "session not granted yet");
                }
                Err(err) => {
                    error!(user_id = self.user_id, error = %err, "pairing poll failed");
                    self.update(&cancelled, |request| {
                        request.state = PairingState::Failed;
                        request.request_token.clear();
                        request.authorization_url.clear();
                        request.error = Some(PairingError::Failed(err));
                    });
                    return;
                }
            }
            remaining -= 1;
            self.update(&cancelled, |request| {
                request.poll_attempts_remaining = remaining;
            });
        }

        info!(user_id = self.user_id, "authorization link expired");
        self.update(&cancelled, |request| {
            request.state = PairingState::Expired;
            request.request_token.clear();
            request.authorization_url.clear();
            request.error = Some(PairingError::Expired);
        });
    }

    async fn commit(&self, grant: SessionGrant, cancelled: &AtomicBool) {
        let _commit = self.commit.lock().await;
        if cancelled.load(Ordering::SeqCst) {
            debug!(user_id = self.user_id, "discarding pairing result after unlink");
            return;
        }
        let outcome = self
            .sessions
            .link(self.user_id, grant.session_key.clone(), grant.username.clone())
            .await;
        match outcome {
            Ok(_) => {
                info!(user_id = self.user_id, username = %grant.username, "linked tracking account");
                self.update(cancelled, |request| {
                    request.state = PairingState::Linked;
                    request.request_token.clear();
                    request.authorization_url.clear();
                    request.session_key = Some(grant.session_key);
                    request.username = Some(grant.username);
                });
            }
            Err(err) => {
                error!(user_id = self.user_id, error = %err, "failed storing linked session");
                self.update(cancelled, |request| {
                    request.state = PairingState::Failed;
                    request.error = Some(PairingError::Store(err));
                });
            }
        }
    }

    // The flag is read under the channel's write lock.
    fn update(&self, cancelled: &AtomicBool, change: impl FnOnce(&mut PairingRequest)) {
        self.request.send_if_modified(|request| {
            if cancelled.load(Ordering::SeqCst) {
                return false;
            }
            change(request);
            true
        });
    }
}

fn deadline(ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    Utc::now().checked_add_signed(ttl)
}
