//! HTTP routes: model listing, streaming synthesis and health.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::http::{HeaderName, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::error::ApiError;
use super::rate_limit::limit_requests;
use super::relay::{self, BodyReceiver, SINK_CAPACITY};
use super::state::AppState;
use crate::error::PipelineError;
use crate::tts::{self, ProsodyRequest, SynthesisParams, invoker};

/// Body of `POST /synthesis`.
#[derive(Debug, Deserialize)]
pub struct SynthesisRequest {
    pub voice: String,
    pub text: String,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
}

impl SynthesisRequest {
    fn prosody(&self) -> ProsodyRequest {
        ProsodyRequest { speed: self.speed, pitch: self.pitch, volume: self.volume }
    }
}

#[derive(Debug, Serialize)]
struct ModelsResponse<'a> {
    success: bool,
    models: &'a [String],
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    success: bool,
    voices: usize,
    active_sessions: usize,
}

/// Build the router. Only synthesis goes through the rate limiter.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/synthesis", post(synthesis).layer(middleware::from_fn_with_state(state.clone(), limit_requests)))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_models(State(state): State<AppState>) -> Response {
    Json(ModelsResponse { success: true, models: state.registry.names() }).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { success: true, voices: state.registry.len(), active_sessions: state.transcoder.stats().active() })
}

/// Stream `text` spoken by `voice` as ADTS AAC.
///
/// Everything that can fail before audio exists is checked in order (body, parameters,
/// text, voice, transcoder, first encoded chunk) and reported as a JSON error. The 200
/// and its headers are only committed once the first chunk is in hand.
async fn synthesis(State(state): State<AppState>, body: Result<Json<SynthesisRequest>, JsonRejection>) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| PipelineError::Validation(e.body_text()))?;

    let params = SynthesisParams::from_request(request.prosody())?;
    invoker::validate_text(&request.text)?;
    let voice = state.registry.lookup(&request.voice)?;
    let program = state.transcoder.preflight()?;

    info!("🗣️ Synthesis: voice '{}', {} chars ({:?})", request.voice, request.text.chars().count(), params);

    let pcm = tts::synthesize(voice, &request.text, params, state.invoker)?;
    let mut session = state.transcoder.open(&program, pcm, state.shutdown.child_token())?;

    let first = match session.next_chunk().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(PipelineError::Transcode("transcoder produced no audio".to_string()).into()),
    };
    debug!("First encoded chunk from transcoder {:?} ({} bytes), committing response", session.pid(), first.len());

    let (sink, body) = relay::body_channel(SINK_CAPACITY);
    let voice_name = request.voice;
    tokio::spawn(async move {
        let outcome = relay::relay(session, Some(first), sink).await;
        outcome.log(&voice_name);
    });

    Ok(audio_response(body))
}

fn audio_response(mut body: BodyReceiver) -> Response {
    let stream = async_stream::stream! {
        while let Some(item) = body.recv().await {
            yield item;
        }
    };

    let headers = [
        (header::CONTENT_TYPE, "audio/aac"),
        (header::CACHE_CONTROL, "no-cache"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    (headers, Body::from_stream(stream)).into_response()
}
