//! # Telephony Call Webhooks
//!
//! HTTP endpoints the provider calls around a phone call's lifecycle:
//!
//! 1. **Incoming call** (`POST /api/telephony/calls/incoming`): allocate a
//!    bridge session and answer with TwiML instructing the provider to open
//!    a media-streams WebSocket back to us.
//! 2. **Status callback** (`POST /api/telephony/calls/status`): track the
//!    provider's call state; terminal states tear the bridge session down.
//! 3. **Bridge introspection** (`GET .../bridge/status`, `.../bridge/metrics`):
//!    JSON snapshots of one session's state and counters.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Provider call states, mapped from the `CallStatus` webhook field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Answered,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Canceled,
}

impl CallStatus {
    /// Map the provider's status vocabulary. Unknown strings are treated as
    /// failures so a protocol change can never leave a session leaking.
    pub fn parse(status: &str) -> Self {
        match status {
            "ringing" => CallStatus::Ringing,
            "in-progress" | "answered" => CallStatus::Answered,
            "completed" => CallStatus::Completed,
            "failed" | "error" => CallStatus::Failed,
            "no-answer" => CallStatus::NoAnswer,
            "busy" => CallStatus::Busy,
            "canceled" => CallStatus::Canceled,
            other => {
                warn!(status = other, "unknown call status");
                CallStatus::Failed
            }
        }
    }

    /// Whether this state ends the call (and with it the bridge session).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
                | CallStatus::Canceled
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct CallStatusForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

/// Handle an incoming call webhook.
///
/// Allocates a fresh bridge session and returns TwiML pointing the provider
/// at our media-streams WebSocket for that session. Both tracks are
/// requested; the outbound echo is filtered on receive.
pub async fn incoming_call(
    form: web::Form<IncomingCallForm>,
    req: HttpRequest,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let form = form.into_inner();
    if form.call_sid.is_empty() {
        return Err(AppError::BadRequest("Missing CallSid".to_string()));
    }

    info!(
        call_sid = %form.call_sid,
        from = %form.from,
        to = %form.to,
        "incoming call"
    );

    let session_id = Uuid::new_v4().to_string();
    state.bridge().create(&session_id)?;

    let host = req.connection_info().host().to_string();
    let stream_url = format!(
        "wss://{}/api/telephony/calls/stream/{}?call_sid={}",
        host, session_id, form.call_sid
    );

    info!(%session_id, %stream_url, "created bridge session for call");

    Ok(HttpResponse::Ok()
        .content_type("application/xml")
        .body(stream_twiml(&stream_url)))
}

/// Handle a call status callback.
///
/// Always answers 200; the provider does not care about our internal
/// bookkeeping. Terminal statuses close the associated bridge session,
/// resolved through the CallSid the link recorded at upgrade time.
pub async fn call_status(
    form: web::Form<CallStatusForm>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let form = form.into_inner();
    if form.call_sid.is_empty() {
        return Err(AppError::BadRequest("Missing CallSid".to_string()));
    }

    let status = CallStatus::parse(&form.call_status);
    info!(call_sid = %form.call_sid, status = ?status, "call state change");

    if status.is_terminal() {
        if let Some(session) = state.bridge().find_by_call_sid(&form.call_sid) {
            let session_id = session.session_id().to_string();
            info!(call_sid = %form.call_sid, %session_id, "terminal call status, closing session");
            state.bridge().close(&session_id);
        }
    }

    Ok(HttpResponse::Ok().finish())
}

/// Return the status snapshot of one bridge session.
pub async fn bridge_status(
    query: web::Query<SessionQuery>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let session_id = require_session_id(query.into_inner())?;
    let session = state
        .bridge()
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;

    Ok(HttpResponse::Ok().json(session.status()))
}

/// Return the metrics snapshot of one bridge session.
pub async fn bridge_metrics(
    query: web::Query<SessionQuery>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let session_id = require_session_id(query.into_inner())?;
    let session = state
        .bridge()
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;

    Ok(HttpResponse::Ok().json(session.metrics_snapshot()))
}

fn require_session_id(query: SessionQuery) -> AppResult<String> {
    query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing session_id".to_string()))
}

/// TwiML telling the provider to open a media stream on both tracks.
fn stream_twiml(stream_url: &str) -> String {
    format!(
        r#"<Response><Start><Stream url="{}" track="both"/></Start></Response>"#,
        xml_escape(stream_url)
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_call_status_mapping() {
        assert_eq!(CallStatus::parse("ringing"), CallStatus::Ringing);
        assert_eq!(CallStatus::parse("in-progress"), CallStatus::Answered);
        assert_eq!(CallStatus::parse("answered"), CallStatus::Answered);
        assert_eq!(CallStatus::parse("completed"), CallStatus::Completed);
        assert_eq!(CallStatus::parse("failed"), CallStatus::Failed);
        assert_eq!(CallStatus::parse("error"), CallStatus::Failed);
        assert_eq!(CallStatus::parse("no-answer"), CallStatus::NoAnswer);
        assert_eq!(CallStatus::parse("busy"), CallStatus::Busy);
        assert_eq!(CallStatus::parse("canceled"), CallStatus::Canceled);
        assert_eq!(CallStatus::parse("something-new"), CallStatus::Failed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(CallStatus::Busy.is_terminal());
        assert!(CallStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_twiml_shape() {
        let twiml = stream_twiml("wss://example.com/api/telephony/calls/stream/abc?call_sid=CA1");
        assert_eq!(
            twiml,
            "<Response><Start><Stream url=\"wss://example.com/api/telephony/calls/stream/abc?call_sid=CA1\" track=\"both\"/></Start></Response>"
        );
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape(r#"a"b&c<d>"#), "a&quot;b&amp;c&lt;d&gt;");
    }

    #[actix_rt::test]
    async fn test_terminal_status_closes_session() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let session = state.bridge().create("S1").unwrap();
        session.set_call_sid("CA42".to_string());

        // Non-terminal status leaves the session alone.
        let form = web::Form(CallStatusForm {
            call_sid: "CA42".to_string(),
            call_status: "ringing".to_string(),
        });
        call_status(form, state.clone()).await.unwrap();
        assert_eq!(state.bridge().session_count(), 1);

        // Terminal status tears it down.
        let form = web::Form(CallStatusForm {
            call_sid: "CA42".to_string(),
            call_status: "completed".to_string(),
        });
        let resp = call_status(form, state.clone()).await.unwrap();
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
        assert_eq!(state.bridge().session_count(), 0);
    }

    #[actix_rt::test]
    async fn test_status_endpoint_requires_known_session() {
        let state = web::Data::new(AppState::new(AppConfig::default()));

        let missing = bridge_status(web::Query(SessionQuery { session_id: None }), state.clone())
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::BadRequest(_)));

        let unknown = bridge_status(
            web::Query(SessionQuery {
                session_id: Some("nope".to_string()),
            }),
            state.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(unknown, AppError::NotFound(_)));

        state.bridge().create("S1").unwrap();
        let ok = bridge_status(
            web::Query(SessionQuery {
                session_id: Some("S1".to_string()),
            }),
            state,
        )
        .await
        .unwrap();
        assert_eq!(ok.status(), actix_web::http::StatusCode::OK);
    }
}
