//! `POST /v1/chat/completions` — the state machine from §4.8: authenticate
//! (done by the middleware), rate-check, resolve the endpoint, enrich,
//! dispatch (optionally through one tool-calling round), sign, meter, and
//! log. Both the non-streaming and SSE-streaming paths share every stage up
//! to dispatch.

use std::time::Instant;

use attestgate_auth::AuthenticationInfo;
use attestgate_core::error::GatewayError;
use attestgate_core::message::{new_request_id, now, ChatRequest, Source};
use attestgate_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use attestgate_core::query_log::QueryLog;
use attestgate_enrich::NilragRequestOptions;
use attestgate_providers::OpenAiCompatProvider;
use attestgate_telemetry::{MeteringContext, NoopMeter, QueryLogStore, ResponseUsage, SqlxQueryLogStore};
use attestgate_toolloop::{extract_tool_calls, run_tool_loop};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::stream;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info_span, warn, Instrument};

use crate::error::ApiError;
use crate::SharedState;

#[derive(Serialize)]
pub struct SignedChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub signature: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
}

#[derive(Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: attestgate_core::message::ChatMessage,
    pub finish_reason: String,
}

pub async fn chat_completions(
    State(state): State<SharedState>,
    Extension(auth_info): Extension<AuthenticationInfo>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let mut log = QueryLog::pending(new_request_id());
    log.user_id = auth_info.user.user_id.clone();
    log.model = request.model.clone();
    log.temperature = request.temperature;
    log.max_tokens = request.max_tokens.map(|m| m as i64);
    log.was_streamed = request.stream;
    log.was_multimodal = request.has_multimodal_content();
    log.was_nilrag = request.nilrag.is_some();

    match process(&state, &auth_info, request, log, started).await {
        Ok(response) => Ok(response),
        Err((err, mut log)) => {
            log.response_time_ms = started.elapsed().as_millis() as i64;
            let status = err.status_code();
            log.error_code = status as i32;
            log.error_message = err.to_string();
            if status >= 500 {
                if let Err(e) = state.query_log.commit(&log).await {
                    warn!(error = %e, "failed to persist query log synchronously");
                }
            } else {
                warn!(status, error = %err, "chat request rejected");
            }
            Err(ApiError::from(err))
        }
    }
}

/// Drives the request to a response, owning `log` throughout so every exit
/// path — including the deferred commit once an SSE stream actually
/// terminates — carries it back out. On success the commit has already
/// happened (synchronously for non-streaming, from inside the stream for
/// streaming); on failure the caller commits using the `log` returned
/// alongside the error.
async fn process(
    state: &SharedState,
    auth_info: &AuthenticationInfo,
    mut request: ChatRequest,
    mut log: QueryLog,
    started: Instant,
) -> Result<Response, (GatewayError, QueryLog)> {
    if let Err(e) = request.validate() {
        return Err((GatewayError::BadRequest(e), log));
    }

    let endpoint = match state.registry.get(&request.model).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => {
            return Err((
                GatewayError::BadRequest(format!("unknown model: {}", request.model)),
                log,
            ))
        }
        Err(e) => return Err((GatewayError::from(e), log)),
    };

    if !request.tools.is_empty() && !endpoint.metadata.supports_tools {
        return Err((
            GatewayError::BadRequest(format!("model {} does not support tools", request.model)),
            log,
        ));
    }
    if request.has_multimodal_content() {
        if !endpoint.metadata.supports_multimodal {
            return Err((
                GatewayError::BadRequest(format!("model {} does not support multimodal content", request.model)),
                log,
            ));
        }
        request.web_search = Some(false);
    }

    let limits = auth_info
        .user
        .rate_limits
        .get_effective_limits(rate_limit_defaults(&state.config.rate_limiting));
    if let Err(e) = state.rate_limiter.check_chat_limits(&auth_info.user.user_id, &limits).await {
        return Err((GatewayError::from(e), log));
    }
    if !auth_info.token_rate_limits.is_empty() {
        if let Err(e) = state.rate_limiter.check_token_limits(&auth_info.token_rate_limits).await {
            return Err((GatewayError::from(e), log));
        }
    }
    if request.web_search == Some(true) {
        if let Err(e) = state
            .rate_limiter
            .check_web_search_limits(&auth_info.user.user_id, &limits)
            .await
        {
            return Err((GatewayError::from(e), log));
        }
    }

    let sources = match enrich(state, auth_info, &mut request, &mut log).await {
        Ok(sources) => sources,
        Err(e) => return Err((e, log)),
    };

    let metering = if auth_info.bypass_metering {
        MeteringContext::start(Arc::new(NoopMeter), &auth_info.user.user_id, false).await
    } else {
        MeteringContext::start(
            state.credit_meter.clone(),
            &auth_info.user.user_id,
            auth_info.is_capability,
        )
        .await
    };
    let metering = match metering {
        Ok(m) => m,
        Err(e) => return Err((GatewayError::from(e), log)),
    };

    let provider = OpenAiCompatProvider::for_endpoint(&request.model, endpoint.url.clone(), state.http_client.clone());
    let concurrency_key = format!("model:{}", request.model);
    if let Err(e) = state
        .rate_limiter
        .acquire_concurrent(&concurrency_key, state.config.rate_limiting.max_concurrent_requests)
        .await
    {
        return Err((GatewayError::from(e), log));
    }

    let dispatch_result: Result<Response, (GatewayError, QueryLog)> = if request.stream {
        stream_response(state, &provider, &request, metering, log, sources, started).await
    } else {
        match non_streaming_response(state, &provider, &request, &metering, &mut log, sources).await {
            Ok(response) => {
                log.response_time_ms = started.elapsed().as_millis() as i64;
                log.error_code = 200;
                SqlxQueryLogStore::commit_background(state.query_log.clone(), log);
                Ok(response)
            }
            Err(e) => Err((e, log)),
        }
    };

    if let Err(e) = state.rate_limiter.release_concurrent(&concurrency_key).await {
        warn!(error = %e, "failed to release concurrency gauge");
    }

    dispatch_result
}

fn rate_limit_defaults(cfg: &attestgate_core::config::RateLimitConfig) -> attestgate_core::user::RateLimitDefaults {
    attestgate_core::user::RateLimitDefaults {
        minute: cfg.minute,
        hour: cfg.hour,
        day: cfg.day,
        forever: cfg.forever,
        web_search_minute: cfg.web_search_minute,
        web_search_hour: cfg.web_search_hour,
        web_search_day: cfg.web_search_day,
    }
}

/// Stages 1-3 of §4.6, in order. Stage 1 is critical (any failure aborts the
/// request); stages 2-3 degrade gracefully, logging and moving on.
async fn enrich(
    state: &SharedState,
    auth_info: &AuthenticationInfo,
    request: &mut ChatRequest,
    log: &mut QueryLog,
) -> Result<Vec<Source>, GatewayError> {
    if let Some(binding) = &auth_info.prompt_document {
        attestgate_enrich::handle_stored_prompt(request, binding, state.document_store.as_ref()).await?;
        log.was_nildb = true;
    }

    if let Some(options) = &request.nilrag {
        let nilrag_options = NilragRequestOptions {
            nodes: state.vault_nodes.clone(),
            num_chunks: options.top_k,
        };
        if let Err(e) = attestgate_enrich::handle_nilrag(request, &nilrag_options, state.vault_client.as_ref()).await
        {
            warn!(error = %e, "nilrag enrichment degraded, continuing without retrieved context");
        }
    }

    let mut sources = Vec::new();
    if request.web_search == Some(true) {
        let model = request.model.clone();
        match attestgate_enrich::handle_web_search(
            request,
            &model,
            state.query_planner.as_ref(),
            state.search_provider.as_ref(),
        )
        .await
        {
            Ok(enriched) => {
                log.web_search_calls = enriched.sources.len() as i64;
                sources = enriched.sources;
            }
            Err(e) => {
                warn!(error = %e, "web search enrichment degraded, continuing without results");
            }
        }
    }

    Ok(sources)
}

fn to_provider_request(request: &ChatRequest) -> ProviderRequest {
    ProviderRequest {
        model: request.model.clone(),
        messages: request.messages.clone(),
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        tools: request.tools.clone(),
        tool_choice: request.tool_choice.clone(),
        stream: false,
    }
}

async fn non_streaming_response(
    state: &SharedState,
    provider: &OpenAiCompatProvider,
    request: &ChatRequest,
    metering: &MeteringContext,
    log: &mut QueryLog,
    sources: Vec<Source>,
) -> Result<Response, GatewayError> {
    let provider_request = to_provider_request(request);
    let dispatch_started = Instant::now();
    let initial = provider
        .complete(provider_request.clone())
        .instrument(info_span!("dispatch", model = %request.model))
        .await?;
    log.model_response_time_ms = dispatch_started.elapsed().as_millis() as i64;

    let had_tool_calls = !extract_tool_calls(&initial.message).is_empty();
    let tool_started = Instant::now();
    let (response, usage) = run_tool_loop(initial, provider_request, provider, state.tools.as_ref())
        .instrument(info_span!("tool_loop"))
        .await?;
    if had_tool_calls {
        log.tool_response_time_ms = tool_started.elapsed().as_millis() as i64;
        log.tool_calls = 1;
    }

    log.prompt_tokens = usage.prompt_tokens as i64;
    log.completion_tokens = usage.completion_tokens as i64;
    log.total_tokens = usage.total_tokens as i64;

    metering
        .set_response(ResponseUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            web_searches: log.web_search_calls as u32,
        })
        .await
        .map_err(GatewayError::from)?;

    let signed = sign_completion(state, response, usage, sources)?;
    Ok(Json(signed).into_response())
}

fn sign_completion(
    state: &SharedState,
    response: ProviderResponse,
    usage: Usage,
    sources: Vec<Source>,
) -> Result<SignedChatCompletion, GatewayError> {
    let unsigned = SignedChatCompletion {
        id: response.id,
        object: "chat.completion",
        created: now().timestamp(),
        model: response.model,
        choices: vec![Choice {
            index: 0,
            message: response.message,
            finish_reason: response.finish_reason,
        }],
        usage,
        signature: String::new(),
        sources,
    };
    let value = serde_json::to_value(&unsigned).map_err(|e| GatewayError::Internal(e.to_string()))?;
    let canonical = attestgate_crypto::canonicalize(&value);
    let signature = state.keystore.sign(canonical.as_bytes()).map_err(GatewayError::from)?;
    Ok(SignedChatCompletion { signature, ..unsigned })
}

/// SSE passthrough: no tool loop (§4.8 restricts the tool-calling round to
/// the non-streaming path, matching the upstream chunk format having no
/// structured place to splice a mid-stream tool result). The terminal chunk
/// — the one carrying `usage` — gets `sources` attached and triggers the
/// metering callback. `log` is carried inside the stream's own state and
/// committed exactly once the stream actually terminates, with whatever
/// usage was observed (or `error_code = 500` if none ever arrived), so the
/// query log reflects what happened on the wire rather than what was true
/// the instant the SSE response was constructed.
async fn stream_response(
    state: &SharedState,
    provider: &OpenAiCompatProvider,
    request: &ChatRequest,
    metering: MeteringContext,
    mut log: QueryLog,
    sources: Vec<Source>,
    started: Instant,
) -> Result<Response, (GatewayError, QueryLog)> {
    let provider_request = to_provider_request(request);
    let receiver = match provider.stream(provider_request).await {
        Ok(r) => r,
        Err(e) => return Err((GatewayError::from(e), log)),
    };
    let web_searches = log.web_search_calls as u32;
    let sources_json = serde_json::to_value(&sources).unwrap_or(Value::Array(Vec::new()));
    let query_log = state.query_log.clone();

    let events = stream::unfold(
        (receiver, metering, web_searches, sources_json, Some(log), query_log, started),
        move |(mut rx, metering, web_searches, sources_json, mut log, query_log, started)| async move {
        if log.is_none() {
            return None;
        }
        match rx.recv().await {
            Some(Ok(chunk)) => {
                let mut payload = chunk.raw.clone();
                let mut terminal = chunk.done;
                if let Value::Object(ref mut map) = payload {
                    if chunk.done {
                        map.insert("sources".to_string(), sources_json.clone());
                    }
                }
                if let Some(usage) = chunk.usage {
                    terminal = true;
                    if let Err(e) = metering
                        .set_response(ResponseUsage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                            web_searches,
                        })
                        .await
                    {
                        warn!(error = %e, "failed to report streamed usage to credit service");
                    }
                    if let Some(l) = log.as_mut() {
                        l.prompt_tokens = usage.prompt_tokens as i64;
                        l.completion_tokens = usage.completion_tokens as i64;
                        l.total_tokens = usage.total_tokens as i64;
                    }
                }
                let event = Event::default().data(payload.to_string());
                if terminal {
                    if let Some(mut l) = log.take() {
                        l.response_time_ms = started.elapsed().as_millis() as i64;
                        l.error_code = 200;
                        SqlxQueryLogStore::commit_background(query_log.clone(), l);
                    }
                }
                Some((
                    Ok::<_, std::convert::Infallible>(event),
                    (rx, metering, web_searches, sources_json, log, query_log, started),
                ))
            }
            Some(Err(e)) => {
                warn!(error = %e, "upstream stream interrupted");
                let error_payload = serde_json::json!({"error": "stream_failed", "message": e.to_string()});
                let event = Event::default().data(error_payload.to_string());
                if let Some(mut l) = log.take() {
                    l.response_time_ms = started.elapsed().as_millis() as i64;
                    l.error_code = 500;
                    l.error_message = e.to_string();
                    SqlxQueryLogStore::commit_background(query_log.clone(), l);
                }
                Some((Ok(event), (rx, metering, web_searches, sources_json, log, query_log, started)))
            }
            None => {
                if let Some(mut l) = log.take() {
                    l.response_time_ms = started.elapsed().as_millis() as i64;
                    l.error_code = 500;
                    l.error_message = "stream closed before a terminal usage chunk arrived".to_string();
                    SqlxQueryLogStore::commit_background(query_log.clone(), l);
                }
                None
            }
        }
    },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response())
}
