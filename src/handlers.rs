use crate::consts::INBOUND_GREETING;
use crate::db_types::{
    CallEvent, CallEventType, CallRecording, CallSession, CallSupervision, DialerCampaign,
    DialerQueueItem, NewCampaign, SupervisionType,
};
use crate::error::AppError;
use crate::tasks::forward_events_to_socket;
use crate::twilio_types::{
    wrap_twiml, CallStatusCallback, CallbackQuery, ConferenceNoun, DialAction, DialTarget,
    RecordingStatusCallback, Response, ResponseAction, SayAction, TwilioVoicePayload, TwimlBool,
};
use crate::types::{AppState, OriginateRequest, ProviderEvent, RecordingRef};
use crate::utils::conference_name;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, trace};
use uuid::Uuid;

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/twilio/call-status", post(call_status_webhook))
        .route("/twilio/recording-status", post(recording_status_webhook))
        .route("/twilio/voice/inbound", post(inbound_voice_webhook))
        .route("/twilio/twiml/conference/:session_id", post(conference_twiml))
        .route("/api/calls", post(start_call))
        .route("/api/calls/:id", get(get_call))
        .route("/api/calls/:id/events", get(list_call_events).post(append_call_event))
        .route("/api/calls/:id/cancel", post(cancel_call))
        .route("/api/calls/:id/disposition", put(set_disposition))
        .route("/api/campaigns", post(create_campaign))
        .route("/api/campaigns/:id/pause", post(pause_campaign))
        .route("/api/campaigns/:id/resume", post(resume_campaign))
        .route("/api/campaigns/:id/complete", post(complete_campaign))
        .route("/api/campaigns/:id/queue", post(enqueue_lead))
        .route("/api/campaigns/:id/next", get(next_queue_item))
        .route("/api/queue/:id/skip", post(skip_queue_item))
        .route("/api/supervisions", post(start_supervision))
        .route("/api/supervisions/:id/end", post(end_supervision))
        .route("/api/supervisions/:id/notes", put(update_supervision_notes))
        .route("/api/recordings/:id", get(get_recording))
        .route("/api/recordings/:id/resume", post(resume_recording))
        .route("/api/events", get(events_ws_handler))
        .route("/", get(|| async { "call orchestrator" }))
        .with_state(app_state)
}

fn twiml_response(response: Response) -> impl IntoResponse {
    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

/// Puts the call leg into the session's conference, where supervisors can be bridged in.
fn conference_response(session_id: Uuid, greeting: Option<&str>) -> Response {
    let mut actions = Vec::new();
    if let Some(text) = greeting {
        actions.push(ResponseAction::Say(SayAction {
            text: text.to_string(),
            ..Default::default()
        }));
    }
    actions.push(ResponseAction::Dial(DialAction {
        timeout: None,
        target: DialTarget::Conference(ConferenceNoun {
            name: conference_name(session_id),
            beep: Some(TwimlBool::False),
            start_conference_on_enter: Some(TwimlBool::True),
            end_conference_on_exit: Some(TwimlBool::True),
            ..Default::default()
        }),
    }));
    Response { actions }
}

fn parse_form<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> Result<T, AppError> {
    serde_urlencoded::from_str::<T>(body).map_err(|e| {
        error!(error=%e, "failed to deserialize Twilio {what} payload");
        AppError::InvalidRequest(format!("malformed {what} payload"))
    })
}

pub async fn call_status_webhook(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Result<StatusCode, AppError> {
    trace!(body=%body, "call status body");
    let payload: CallStatusCallback = parse_form(&body, "call status")?;
    let recording = match (payload.recording_sid, payload.recording_url) {
        (Some(provider_recording_id), Some(url)) => Some(RecordingRef {
            provider_recording_id,
            url,
            duration_seconds: payload.recording_duration,
            size_bytes: None,
        }),
        _ => None,
    };
    let event = ProviderEvent {
        provider_call_id: payload.call_sid,
        raw_status: payload.call_status,
        session_hint: query.session_id,
        duration_seconds: payload.call_duration,
        recording,
    };
    let applied = app_state.calls.apply_provider_event(event).await?;
    debug!(?applied, "call status applied");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn recording_status_webhook(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Result<StatusCode, AppError> {
    trace!(body=%body, "recording status body");
    let payload: RecordingStatusCallback = parse_form(&body, "recording status")?;
    if payload.recording_status != "completed" {
        debug!(status=%payload.recording_status, recording=%payload.recording_sid, "recording not ready");
        return Ok(StatusCode::NO_CONTENT);
    }
    let recording = RecordingRef {
        provider_recording_id: payload.recording_sid,
        url: payload.recording_url,
        duration_seconds: payload.recording_duration,
        size_bytes: None,
    };
    app_state
        .calls
        .attach_recording(&payload.call_sid, query.session_id, recording)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn inbound_voice_webhook(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    trace!(body=%body, "inbound voice body");
    let payload: TwilioVoicePayload = parse_form(&body, "voice")?;
    debug!(call_sid=%payload.call_sid, status=%payload.call_status, direction=?payload.direction, "inbound call");
    let session = app_state
        .calls
        .register_inbound(&payload.call_sid, &payload.from, &payload.to)
        .await?;
    Ok(twiml_response(conference_response(
        session.id,
        Some(INBOUND_GREETING),
    )))
}

pub async fn conference_twiml(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = app_state.calls.get_session(session_id).await?;
    Ok(twiml_response(conference_response(session.id, None)))
}

#[derive(Deserialize)]
pub struct StartCallRequest {
    pub to: String,
    pub from: Option<String>,
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub lead_id: Option<Uuid>,
}

pub async fn start_call(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<StartCallRequest>,
) -> Result<(StatusCode, Json<CallSession>), AppError> {
    if request.to.trim().is_empty() {
        return Err(AppError::InvalidRequest("to number is empty".to_string()));
    }
    let from = request
        .from
        .unwrap_or_else(|| app_state.settings.caller_id.clone());
    let originate = OriginateRequest::outbound(
        &from,
        request.to.trim(),
        request.user_id,
        request.company_id,
        request.lead_id,
    );
    let session_id = app_state.calls.originate(originate).await?;
    let session = app_state.calls.get_session(session_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_call(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CallSession>, AppError> {
    Ok(Json(app_state.calls.get_session(id).await?))
}

pub async fn list_call_events(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CallEvent>>, AppError> {
    Ok(Json(app_state.calls.events(id).await?))
}

#[derive(Deserialize)]
pub struct AppendEventRequest {
    pub event_type: CallEventType,
    #[serde(default)]
    pub payload: Value,
    pub acting_user_id: Option<Uuid>,
}

pub async fn append_call_event(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<AppendEventRequest>,
) -> Result<(StatusCode, Json<CallEvent>), AppError> {
    let event = app_state
        .calls
        .append_event(id, request.event_type, request.payload, request.acting_user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub acting_user_id: Option<Uuid>,
}

pub async fn cancel_call(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    request: Option<Json<CancelRequest>>,
) -> Result<Json<CallSession>, AppError> {
    let acting_user_id = request.and_then(|Json(r)| r.acting_user_id);
    Ok(Json(app_state.calls.cancel(id, acting_user_id).await?))
}

#[derive(Deserialize)]
pub struct DispositionRequest {
    pub disposition: String,
    pub notes: Option<String>,
}

pub async fn set_disposition(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<DispositionRequest>,
) -> Result<Json<CallSession>, AppError> {
    let session = app_state
        .calls
        .set_disposition(id, &request.disposition, request.notes)
        .await?;
    Ok(Json(session))
}

pub async fn create_campaign(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<NewCampaign>,
) -> Result<(StatusCode, Json<DialerCampaign>), AppError> {
    let campaign = app_state.dialer.create_campaign(request).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn pause_campaign(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DialerCampaign>, AppError> {
    Ok(Json(app_state.dialer.pause(id).await?))
}

pub async fn resume_campaign(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DialerCampaign>, AppError> {
    Ok(Json(app_state.dialer.resume(id).await?))
}

pub async fn complete_campaign(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DialerCampaign>, AppError> {
    Ok(Json(app_state.dialer.complete(id).await?))
}

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub lead_id: Uuid,
    pub phone_number: String,
    #[serde(default)]
    pub priority: i32,
}

pub async fn enqueue_lead(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<DialerQueueItem>), AppError> {
    let item = app_state
        .dialer
        .enqueue(id, request.lead_id, &request.phone_number, request.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn next_queue_item(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<DialerQueueItem>>, AppError> {
    Ok(Json(app_state.dialer.select_next(id).await?))
}

pub async fn skip_queue_item(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DialerQueueItem>, AppError> {
    Ok(Json(app_state.dialer.skip(id).await?))
}

#[derive(Deserialize)]
pub struct StartSupervisionRequest {
    pub session_id: Uuid,
    pub supervisor_id: Uuid,
    pub supervision_type: SupervisionType,
}

pub async fn start_supervision(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<StartSupervisionRequest>,
) -> Result<(StatusCode, Json<CallSupervision>), AppError> {
    let supervision = app_state
        .supervision
        .start_supervision(
            request.session_id,
            request.supervisor_id,
            request.supervision_type,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(supervision)))
}

pub async fn end_supervision(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CallSupervision>, AppError> {
    Ok(Json(app_state.supervision.end_supervision(id).await?))
}

#[derive(Deserialize)]
pub struct NotesRequest {
    pub notes: String,
}

pub async fn update_supervision_notes(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<NotesRequest>,
) -> Result<Json<CallSupervision>, AppError> {
    Ok(Json(
        app_state.supervision.update_notes(id, &request.notes).await?,
    ))
}

pub async fn get_recording(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CallRecording>, AppError> {
    Ok(Json(app_state.recordings.get(id).await?))
}

pub async fn resume_recording(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CallRecording>, AppError> {
    Ok(Json(app_state.recordings.resume(id).await?))
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub session_id: Option<Uuid>,
}

pub async fn events_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let bus = app_state.bus.clone();
    ws.on_upgrade(move |socket| forward_events_to_socket(socket, bus, query.session_id))
}
