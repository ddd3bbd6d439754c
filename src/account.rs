use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{AccountError, PairingError};
use crate::pairing::{PairingFlow, PairingRequest, PairingSettings};
use crate::service::{TrackingService, UserProfile};
use crate::session::{SessionCache, UserSession};
use crate::store::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatus {
    Linked {
        profile: UserProfile,
        scrobble_enabled: bool,
    },
    NotLinked,
}

pub struct AccountService {
    service: Arc<dyn TrackingService>,
    sessions: Arc<SessionCache>,
    settings: PairingSettings,
    flows: DashMap<UserId, Arc<PairingFlow>>,
}

impl AccountService {
    pub fn new(
        service: Arc<dyn TrackingService>,
        sessions: Arc<SessionCache>,
        settings: PairingSettings,
    ) -> Self {
        Self {
            service,
            sessions,
            settings,
            flows: DashMap::new(),
        }
    }

    pub fn flow(&self, user_id: UserId) -> Arc<PairingFlow> {
        self.flows
            .entry(user_id)
            .or_insert_with(|| {
                PairingFlow::new(
                    user_id,
                    Arc::clone(&self.service),
                    Arc::clone(&self.sessions),
                    self.settings.clone(),
                )
            })
            .clone()
    }

    pub async fn describe(&self, user_id: UserId) -> Result<AccountStatus, AccountError> {
        let session = self.sessions.get(user_id).await?;
        let Some(session_key) = session.session_key.as_deref() else {
            if session.username.is_some() {
                self.sessions.unlink(user_id).await?;
            }
            return Ok(AccountStatus::NotLinked);
        };
        match self.service.fetch_user_info(session_key).await {
            Ok(profile) => Ok(AccountStatus::Linked {
                profile,
                scrobble_enabled: session.scrobble_enabled,
            }),
            Err(err) if err.is_session_revoked() => {
                warn!(user_id, "stored session was revoked, clearing it");
                self.sessions.unlink(user_id).await?;
                Ok(AccountStatus::NotLinked)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn start_linking(&self, user_id: UserId) -> Result<PairingRequest, PairingError> {
        self.flow(user_id).start_linking().await
    }

    /// Starts (or joins) the user's pairing flow and waits for it to finish.
    pub async fn link(&self, user_id: UserId) -> Result<PairingRequest, PairingError> {
        let flow = self.flow(user_id);
        let outcome = match flow.start_linking().await {
            Ok(_) => flow.wait().await,
            Err(err) => Err(err),
        };
        self.prune(user_id);
        outcome
    }

    pub async fn unlink(&self, user_id: UserId) -> Result<PairingRequest, PairingError> {
        let outcome = self.flow(user_id).unlink().await;
        self.prune(user_id);
        outcome
    }

    fn prune(&self, user_id: UserId) {
        self.flows
            .remove_if(&user_id, |_, flow| flow.snapshot().state.is_terminal());
    }

    pub async fn set_scrobble_enabled(
        &self,
        user_id: UserId,
        enabled: bool,
    ) -> Result<UserSession, AccountError> {
        let session = self.sessions.set_scrobble_enabled(user_id, enabled).await?;
        info!(user_id, enabled, "updated scrobble preference");
        Ok(session)
    }
}
