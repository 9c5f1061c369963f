use crate::config::Config;
use crate::db_types::SupervisionType;
use crate::error::AppError;
use crate::providers::TelephonyProvider;
use crate::twilio_types::{TwilioCallResource, TwilioErrorResponse, TwilioParticipantResource};
use crate::types::{AgentLeg, OriginateRequest, SupervisionBridge};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Twilio REST client for placing calls, adding rep and supervisor legs, and hanging up.
pub struct TwilioClient {
    http_client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    caller_id: String,
    public_base_url: String,
    ring_timeout_secs: u32,
}

impl TwilioClient {
    pub fn new(http_client: reqwest::Client, config: &Config) -> Self {
        Self {
            http_client,
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            caller_id: config.settings.caller_id.clone(),
            public_base_url: config.public_base_url.clone(),
            ring_timeout_secs: config.ring_timeout_secs,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{TWILIO_API_BASE}/Accounts/{}/{path}", self.account_sid)
    }

    fn callback(&self, path: &str, request: &OriginateRequest) -> String {
        format!(
            "{}/twilio/{path}?session_id={}",
            self.public_base_url, request.session_id
        )
    }

    /// Form fields for the Calls resource. `StatusCallbackEvent` repeats, so this is a list.
    fn originate_form(&self, request: &OriginateRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("To", request.to.clone()),
            ("From", request.from.clone()),
            (
                "Url",
                format!(
                    "{}/twilio/twiml/conference/{}",
                    self.public_base_url, request.session_id
                ),
            ),
            ("Timeout", self.ring_timeout_secs.to_string()),
            ("Record", "true".to_string()),
            ("StatusCallback", self.callback("call-status", request)),
            ("RecordingStatusCallback", self.callback("recording-status", request)),
        ];
        for event in ["initiated", "ringing", "answered", "completed"] {
            form.push(("StatusCallbackEvent", event.to_string()));
        }
        form
    }

    fn agent_form(&self, leg: &AgentLeg) -> Vec<(&'static str, String)> {
        vec![
            ("From", self.caller_id.clone()),
            ("To", format!("client:{}", leg.agent_id)),
            ("Beep", "false".to_string()),
            ("EndConferenceOnExit", "true".to_string()),
        ]
    }

    fn participant_form(
        &self,
        bridge: &SupervisionBridge,
    ) -> Result<Vec<(&'static str, String)>, AppError> {
        let mut form = vec![
            ("From", self.caller_id.clone()),
            ("To", format!("client:{}", bridge.supervisor_id)),
            ("Beep", "false".to_string()),
        ];
        match bridge.mode {
            SupervisionType::Listen => form.push(("Muted", "true".to_string())),
            SupervisionType::Whisper => {
                let coach = bridge.coach_call_id.clone().ok_or_else(|| {
                    AppError::InvalidRequest(format!(
                        "call session {} has no rep leg to coach",
                        bridge.session_id
                    ))
                })?;
                form.push(("Coaching", "true".to_string()));
                form.push(("CallSidToCoach", coach));
            }
            SupervisionType::Barge => {}
        }
        Ok(form)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&'static str, String)],
    ) -> Result<T, AppError> {
        let resp = self
            .http_client
            .post(self.url(path))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, path=%path, "failed to send request to twilio");
                AppError::from(e)
            })?;

        let status = resp.status();
        if status.is_client_error() {
            let detail = resp
                .json::<TwilioErrorResponse>()
                .await
                .map(|e| format!("{} ({:?})", e.message, e.code))
                .unwrap_or_else(|_| status.to_string());
            error!(status=%status, detail=%detail, "twilio rejected request");
            return Err(AppError::ProviderRejected(detail));
        }
        if !status.is_success() {
            error!(status=%status, path=%path, "twilio request failed");
            return Err(AppError::Provider(format!("twilio returned {status}")));
        }

        resp.json::<T>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize twilio response");
            AppError::Provider("unreadable twilio response".to_string())
        })
    }
}

#[async_trait]
impl TelephonyProvider for TwilioClient {
    async fn originate(&self, request: &OriginateRequest) -> Result<String, AppError> {
        let call: TwilioCallResource = self
            .post_form("Calls.json", &self.originate_form(request))
            .await?;
        debug!(session_id=%request.session_id, call_sid=%call.sid, status=%call.status, "twilio accepted call");
        Ok(call.sid)
    }

    async fn connect_agent(&self, leg: &AgentLeg) -> Result<String, AppError> {
        let path = format!("Conferences/{}/Participants.json", leg.conference_name);
        let participant: TwilioParticipantResource =
            self.post_form(&path, &self.agent_form(leg)).await?;
        debug!(session_id=%leg.session_id, leg=%participant.call_sid, "rep leg added");
        Ok(participant.call_sid)
    }

    async fn bridge_supervisor(&self, bridge: &SupervisionBridge) -> Result<String, AppError> {
        let path = format!("Conferences/{}/Participants.json", bridge.conference_name);
        let participant: TwilioParticipantResource = self
            .post_form(&path, &self.participant_form(bridge)?)
            .await?;
        debug!(session_id=%bridge.session_id, leg=%participant.call_sid, mode=?bridge.mode, "supervisor leg added");
        Ok(participant.call_sid)
    }

    async fn end_bridge(&self, provider_bridge_id: &str) -> Result<(), AppError> {
        let form = [("Status", "completed".to_string())];
        let _: TwilioCallResource = self
            .post_form(&format!("Calls/{provider_bridge_id}.json"), &form)
            .await?;
        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str, answered: bool) -> Result<(), AppError> {
        let status = if answered { "completed" } else { "canceled" };
        let form = [("Status", status.to_string())];
        let _: TwilioCallResource = self
            .post_form(&format!("Calls/{provider_call_id}.json"), &form)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::CallDirection;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn client() -> TwilioClient {
        let vars: HashMap<String, String> = [
            ("PUBLIC_BASE_URL", "https://dialer.example.com"),
            ("TWILIO_ACCOUNT_SID", "AC123"),
            ("TWILIO_AUTH_TOKEN", "secret"),
            ("TWILIO_CALLER_ID", "+15550001111"),
            ("DEEPGRAM_API_KEY", "dg"),
            ("OPENAI_API_KEY", "sk"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        TwilioClient::new(reqwest::Client::new(), &Config::from_vars(&vars).unwrap())
    }

    #[test]
    fn originate_form_carries_callbacks_and_recording() {
        let request = OriginateRequest {
            session_id: Uuid::new_v4(),
            direction: CallDirection::Outbound,
            from: "+15550001111".to_string(),
            to: "+15550002222".to_string(),
            user_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            lead_id: None,
        };
        let form = client().originate_form(&request);
        let get = |key: &str| form.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone());

        assert_eq!(get("Record").as_deref(), Some("true"));
        assert_eq!(get("Timeout").as_deref(), Some("30"));
        assert_eq!(
            get("StatusCallback").unwrap(),
            format!(
                "https://dialer.example.com/twilio/call-status?session_id={}",
                request.session_id
            )
        );
        assert!(get("RecordingStatusCallback")
            .unwrap()
            .contains("/twilio/recording-status"));
        assert_eq!(
            form.iter().filter(|(k, _)| *k == "StatusCallbackEvent").count(),
            4
        );
    }

    fn bridge(mode: SupervisionType) -> SupervisionBridge {
        SupervisionBridge {
            session_id: Uuid::new_v4(),
            conference_name: "session-x".to_string(),
            supervisor_id: Uuid::new_v4(),
            mode,
            coach_call_id: Some("CA-rep".to_string()),
        }
    }

    fn has_key(form: &[(&'static str, String)], key: &str) -> bool {
        form.iter().any(|(k, _)| *k == key)
    }

    #[test]
    fn listen_joins_muted() {
        let form = client().participant_form(&bridge(SupervisionType::Listen)).unwrap();
        assert!(form.contains(&("Muted", "true".to_string())));
        assert!(!has_key(&form, "Coaching"));
        assert!(!has_key(&form, "CallSidToCoach"));
    }

    #[test]
    fn whisper_coaches_the_rep_leg() {
        let form = client().participant_form(&bridge(SupervisionType::Whisper)).unwrap();
        assert!(form.contains(&("Coaching", "true".to_string())));
        assert!(form.contains(&("CallSidToCoach", "CA-rep".to_string())));
        assert!(!has_key(&form, "Muted"));
    }

    #[test]
    fn whisper_without_rep_leg_is_refused() {
        let bridge = SupervisionBridge {
            coach_call_id: None,
            ..bridge(SupervisionType::Whisper)
        };
        assert!(matches!(
            client().participant_form(&bridge),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn barge_joins_with_full_audio() {
        let b = bridge(SupervisionType::Barge);
        let form = client().participant_form(&b).unwrap();
        assert_eq!(
            form.iter().find(|(k, _)| *k == "To").map(|(_, v)| v.clone()),
            Some(format!("client:{}", b.supervisor_id))
        );
        assert!(!has_key(&form, "Muted"));
        assert!(!has_key(&form, "Coaching"));
    }

    #[test]
    fn rep_leg_dials_the_agent_client() {
        let leg = AgentLeg {
            session_id: Uuid::new_v4(),
            conference_name: "session-x".to_string(),
            agent_id: Uuid::new_v4(),
        };
        let form = client().agent_form(&leg);
        assert!(form.contains(&("To", format!("client:{}", leg.agent_id))));
        assert!(form.contains(&("From", "+15550001111".to_string())));
        assert!(form.contains(&("EndConferenceOnExit", "true".to_string())));
    }
}
