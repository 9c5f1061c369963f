use crate::bus::{DomainEvent, EventBus};
use crate::call_state::CallStateMachine;
use crate::config::OrchestratorSettings;
use crate::db_types::{
    CallDirection, CallStatus, CampaignStatus, DialerCampaign, DialerQueueItem, NewCampaign,
    QueueItemStatus,
};
use crate::error::AppError;
use crate::store::CallStore;
use crate::types::OriginateRequest;
use crate::utils::{with_retry, KeyedLocks, RetryPolicy};

use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use futures_util::future::join_all;
use sqlx::types::time::{OffsetDateTime, Time};
use sqlx::types::Json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `true` when `local` falls inside `[start, end)`. Equal bounds mean no restriction; a start
/// after the end is an overnight window.
pub fn within_working_hours(start: Time, end: Time, local: Time) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= local && local < end
    } else {
        local >= start || local < end
    }
}

pub fn parse_timezone(timezone: &str) -> Result<Tz, AppError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| AppError::InvalidRequest(format!("unknown timezone '{timezone}'")))
}

/// Wall-clock time in `timezone` at the instant `now`.
pub fn campaign_local_time(timezone: &str, now: OffsetDateTime) -> Result<Time, AppError> {
    let tz = parse_timezone(timezone)?;
    let utc = Utc
        .timestamp_opt(now.unix_timestamp(), 0)
        .single()
        .ok_or_else(|| AppError::InvalidRequest(format!("timestamp {now} out of range")))?;
    let local = utc.with_timezone(&tz);
    Time::from_hms(local.hour() as u8, local.minute() as u8, local.second() as u8)
        .map_err(|e| AppError::InvalidRequest(e.to_string()))
}

/// Queue status (and next eligibility) after an attempt ends in `outcome`. `None` for
/// outcomes that do not end an attempt.
pub fn retry_decision(
    outcome: CallStatus,
    attempts: i32,
    max_attempts: i32,
    retry_delay_minutes: i32,
    now: OffsetDateTime,
) -> Option<(QueueItemStatus, Option<OffsetDateTime>)> {
    match outcome {
        CallStatus::Completed => Some((QueueItemStatus::Completed, None)),
        CallStatus::Failed | CallStatus::Cancelled if attempts < max_attempts => {
            let next = (retry_delay_minutes > 0)
                .then(|| now + time::Duration::minutes(i64::from(retry_delay_minutes)));
            Some((QueueItemStatus::Pending, next))
        }
        CallStatus::Failed | CallStatus::Cancelled => Some((QueueItemStatus::Failed, None)),
        CallStatus::Initiated | CallStatus::Ringing | CallStatus::Answered => None,
    }
}

/// Per-campaign dialing queue. Dispatch for one campaign is serialized; campaigns dispatch
/// in parallel.
pub struct DialerScheduler {
    store: Arc<dyn CallStore>,
    calls: Arc<CallStateMachine>,
    bus: EventBus,
    caller_id: String,
    dispatch_interval: Duration,
    retry: RetryPolicy,
    campaign_locks: KeyedLocks<Uuid>,
}

impl DialerScheduler {
    pub fn new(
        settings: &OrchestratorSettings,
        store: Arc<dyn CallStore>,
        calls: Arc<CallStateMachine>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            calls,
            bus,
            caller_id: settings.caller_id.clone(),
            dispatch_interval: settings.dispatch_interval,
            retry: settings.retry,
            campaign_locks: KeyedLocks::new(),
        }
    }

    pub async fn create_campaign(&self, new: NewCampaign) -> Result<DialerCampaign, AppError> {
        if new.name.trim().is_empty() {
            return Err(AppError::InvalidRequest("campaign name is empty".to_string()));
        }
        if new.max_attempts < 1 {
            return Err(AppError::InvalidRequest("max_attempts must be at least 1".to_string()));
        }
        if new.retry_delay_minutes < 0 {
            return Err(AppError::InvalidRequest(
                "retry_delay_minutes must not be negative".to_string(),
            ));
        }
        parse_timezone(&new.timezone)?;

        let campaign = DialerCampaign {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            user_id: new.user_id,
            name: new.name.trim().to_string(),
            lead_filter: Json(new.lead_filter),
            script: new.script,
            max_attempts: new.max_attempts,
            retry_delay_minutes: new.retry_delay_minutes,
            working_hours_start: new.working_hours_start,
            working_hours_end: new.working_hours_end,
            timezone: new.timezone,
            status: CampaignStatus::Active,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_campaign(&campaign).await?;
        info!(campaign_id=%campaign.id, name=%campaign.name, "campaign created");
        self.bus.publish(DomainEvent::CampaignStatusChanged {
            campaign_id: campaign.id,
            status: campaign.status,
        });
        Ok(campaign)
    }

    /// Stops new dispatches; calls already placed resolve through their callbacks.
    pub async fn pause(&self, campaign_id: Uuid) -> Result<DialerCampaign, AppError> {
        self.set_status(campaign_id, CampaignStatus::Paused).await
    }

    pub async fn resume(&self, campaign_id: Uuid) -> Result<DialerCampaign, AppError> {
        self.set_status(campaign_id, CampaignStatus::Active).await
    }

    pub async fn complete(&self, campaign_id: Uuid) -> Result<DialerCampaign, AppError> {
        self.set_status(campaign_id, CampaignStatus::Completed).await
    }

    pub async fn get_campaign(&self, campaign_id: Uuid) -> Result<DialerCampaign, AppError> {
        self.store
            .get_campaign(campaign_id)
            .await?
            .ok_or(AppError::CampaignNotFound(campaign_id))
    }

    async fn set_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> Result<DialerCampaign, AppError> {
        // Waits out an in-flight dispatch, so nothing new dials after a pause returns.
        let _guard = self.campaign_locks.lock(&campaign_id).await;
        let current = self.get_campaign(campaign_id).await?;
        if current.status == status {
            return Ok(current);
        }
        if current.status == CampaignStatus::Completed {
            return Err(AppError::InvalidRequest(format!(
                "campaign {campaign_id} is completed"
            )));
        }
        let updated = self
            .store
            .set_campaign_status(campaign_id, status)
            .await?
            .ok_or(AppError::CampaignNotFound(campaign_id))?;
        info!(campaign_id=%campaign_id, status=?status, "campaign status changed");
        self.bus.publish(DomainEvent::CampaignStatusChanged {
            campaign_id,
            status,
        });
        Ok(updated)
    }

    /// Queue a lead. Rejected while the lead already has a pending or calling item here.
    pub async fn enqueue(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        phone_number: &str,
        priority: i32,
    ) -> Result<DialerQueueItem, AppError> {
        let campaign = self.get_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Completed {
            return Err(AppError::InvalidRequest(format!(
                "campaign {campaign_id} is completed"
            )));
        }
        if phone_number.trim().is_empty() {
            return Err(AppError::InvalidRequest("phone number is empty".to_string()));
        }

        let item = DialerQueueItem {
            id: Uuid::new_v4(),
            campaign_id,
            lead_id,
            phone_number: phone_number.trim().to_string(),
            priority,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            status: QueueItemStatus::Pending,
            session_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_queue_item(&item).await?;
        debug!(campaign_id=%campaign_id, lead_id=%lead_id, priority, "lead queued");
        self.bus.publish(DomainEvent::QueueItemUpdated { item: item.clone() });
        Ok(item)
    }

    pub async fn select_next(&self, campaign_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        let campaign = self.get_campaign(campaign_id).await?;
        self.select_next_at(&campaign, OffsetDateTime::now_utc()).await
    }

    async fn select_next_at(
        &self,
        campaign: &DialerCampaign,
        now: OffsetDateTime,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        if campaign.status != CampaignStatus::Active {
            return Ok(None);
        }
        let local = campaign_local_time(&campaign.timezone, now)?;
        if !within_working_hours(campaign.working_hours_start, campaign.working_hours_end, local) {
            debug!(campaign_id=%campaign.id, local=%local, "outside working hours");
            return Ok(None);
        }
        self.store.next_eligible_item(campaign.id, now).await
    }

    /// One dispatch tick for a campaign: claim the next eligible item and dial it. Returns the
    /// item as it stands after the attempt was started (or failed to start).
    pub async fn dispatch(&self, campaign_id: Uuid) -> Result<Option<DialerQueueItem>, AppError> {
        let _guard = self.campaign_locks.lock(&campaign_id).await;
        let campaign = self.get_campaign(campaign_id).await?;
        let now = OffsetDateTime::now_utc();
        let Some(candidate) = self.select_next_at(&campaign, now).await? else {
            return Ok(None);
        };

        let session_id = Uuid::new_v4();
        let Some(claimed) = self
            .store
            .claim_queue_item(candidate.id, session_id, now)
            .await?
        else {
            debug!(item_id=%candidate.id, "queue item claimed elsewhere");
            return Ok(None);
        };
        self.bus.publish(DomainEvent::QueueItemUpdated {
            item: claimed.clone(),
        });

        let request = OriginateRequest {
            session_id,
            direction: CallDirection::Outbound,
            from: self.caller_id.clone(),
            to: claimed.phone_number.clone(),
            user_id: campaign.user_id,
            company_id: campaign.company_id,
            lead_id: Some(claimed.lead_id),
        };
        match self.calls.originate(request).await {
            Ok(_) => {
                info!(campaign_id=%campaign_id, item_id=%claimed.id, session_id=%session_id, attempt=claimed.attempts, "lead dialed");
                Ok(Some(claimed))
            }
            Err(e) => {
                warn!(error=%e, item_id=%claimed.id, "dial attempt failed to start");
                match self.record_outcome(session_id, CallStatus::Failed).await {
                    Ok(settled) => Ok(Some(settled.unwrap_or(claimed))),
                    Err(e) => {
                        // reconcile settles it on a later tick.
                        error!(error=%e, item_id=%claimed.id, "failed to record unstarted attempt");
                        Ok(Some(claimed))
                    }
                }
            }
        }
    }

    /// Apply the retry policy to the item whose current attempt is `session_id`. Applying the
    /// same outcome twice is a no-op, so transient store failures are retried here.
    pub async fn record_outcome(
        &self,
        session_id: Uuid,
        outcome: CallStatus,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        with_retry(self.retry, "dial outcome", move || {
            self.apply_outcome(session_id, outcome)
        })
        .await
    }

    async fn apply_outcome(
        &self,
        session_id: Uuid,
        outcome: CallStatus,
    ) -> Result<Option<DialerQueueItem>, AppError> {
        let Some(item) = self.store.find_calling_item(session_id).await? else {
            return Ok(None);
        };
        let campaign = self.get_campaign(item.campaign_id).await?;
        let now = OffsetDateTime::now_utc();
        let Some((status, next_attempt_at)) = retry_decision(
            outcome,
            item.attempts,
            campaign.max_attempts,
            campaign.retry_delay_minutes,
            now,
        ) else {
            return Ok(None);
        };

        let updated = self
            .store
            .finish_attempt(item.id, session_id, status, next_attempt_at)
            .await?;
        if let Some(updated) = &updated {
            info!(item_id=%updated.id, outcome=%outcome, status=?updated.status, attempts=updated.attempts, "dial outcome applied");
            self.bus.publish(DomainEvent::QueueItemUpdated {
                item: updated.clone(),
            });
        }
        Ok(updated)
    }

    /// Operator removal of a lead that has not been dialed yet.
    pub async fn skip(&self, item_id: Uuid) -> Result<DialerQueueItem, AppError> {
        match self.store.skip_queue_item(item_id).await? {
            Some(item) => {
                self.bus.publish(DomainEvent::QueueItemUpdated { item: item.clone() });
                Ok(item)
            }
            None => match self.store.get_queue_item(item_id).await? {
                Some(item) => Err(AppError::InvalidRequest(format!(
                    "queue item {item_id} is {:?}, only pending items can be skipped",
                    item.status
                ))),
                None => Err(AppError::QueueItemNotFound(item_id)),
            },
        }
    }

    /// Dispatch every active campaign once per interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.dispatch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval=?self.dispatch_interval, "dialer scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("dialer scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Settle attempts whose call has ended but whose outcome never reached the queue, e.g.
    /// because the store failed while the `CallEnded` event was handled. Returns how many
    /// items moved.
    pub async fn reconcile(&self) -> Result<usize, AppError> {
        let mut settled = 0;
        for item in self.store.list_calling_items().await? {
            let Some(session_id) = item.session_id else {
                continue;
            };
            // Dispatch keeps the campaign lock until the attempt's session exists.
            let _guard = self.campaign_locks.lock(&item.campaign_id).await;
            let outcome = match self.store.get_session(session_id).await {
                Ok(Some(session)) if session.status.is_terminal() => session.status,
                Ok(Some(_)) => continue,
                Ok(None) => CallStatus::Failed,
                Err(e) => {
                    warn!(error=%e, item_id=%item.id, "failed to load attempt session");
                    continue;
                }
            };
            match self.record_outcome(session_id, outcome).await {
                Ok(Some(updated)) => {
                    info!(item_id=%updated.id, session_id=%session_id, outcome=%outcome, "stale dial attempt settled");
                    settled += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(error=%e, item_id=%item.id, "failed to settle dial attempt"),
            }
        }
        Ok(settled)
    }

    async fn tick(&self) {
        if let Err(e) = self.reconcile().await {
            warn!(error=%e, "queue reconciliation failed");
        }
        let campaigns = match self.store.list_campaigns(CampaignStatus::Active).await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                error!(error=%e, "failed to list active campaigns");
                return;
            }
        };
        let results = join_all(campaigns.iter().map(|c| self.dispatch(c.id))).await;
        for (campaign, res) in campaigns.iter().zip(results) {
            if let Err(e) = res {
                warn!(error=%e, campaign_id=%campaign.id, "dispatch failed; retrying next tick");
            }
        }
    }
}
