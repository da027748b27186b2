//! Operator observability surface: `/health` for a quick status probe,
//! `/metrics` for the detailed counters, `/sessions` for a look at who is
//! connected. None of it touches the audio path.

use crate::audio::SessionRegistry;
use crate::error::{AppError, AppResult};
use crate::monitor::SystemMonitor;
use crate::state::AppState;
use crate::transcription::engine::RecognitionEngine;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

pub async fn health_check(
    state: web::Data<AppState>,
    registry: web::Data<Arc<SessionRegistry>>,
    monitor: web::Data<Arc<SystemMonitor>>,
    engine: web::Data<Arc<RecognitionEngine>>,
) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.get_metrics_snapshot();
    let system = monitor.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voicebridge-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "registered": registry.len()
        },
        "decoder": {
            "descriptor": engine.descriptor(),
            "language": config.model.language,
            "sample_rate": engine.sample_rate()
        },
        "system": {
            "cpu_percent": system.cpu_percent,
            "memory_percent": system.memory_percent,
            "process_rss_bytes": system.process_rss_bytes,
            "gpu_available": system.gpu_available
        }
    }))
}

pub async fn detailed_metrics(
    state: web::Data<AppState>,
    monitor: web::Data<Arc<SystemMonitor>>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let system = monitor.snapshot();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms()
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "pipeline": {
            "active_sessions": metrics.active_sessions,
            "frames_received": metrics.frames_received,
            "samples_received": metrics.samples_received,
            "decode_count": metrics.decode_count,
            "decode_errors": metrics.decode_errors,
            "live_emits": metrics.live_emits,
            "commit_emits": metrics.commit_emits,
            "stall_flushes": metrics.stall_flushes,
            "overflow_flushes": metrics.overflow_flushes
        },
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "endpoints": endpoint_stats
        },
        "system": {
            "cpu_percent": system.cpu_percent,
            "cpu_history": system.cpu_history,
            "memory_percent": system.memory_percent,
            "total_memory_bytes": system.total_memory_bytes,
            "used_memory_bytes": system.used_memory_bytes,
            "process_rss_bytes": system.process_rss_bytes
        }
    }))
}

pub async fn list_sessions(
    state: web::Data<AppState>,
    registry: web::Data<Arc<SessionRegistry>>,
) -> HttpResponse {
    let sample_rate = state.get_config().audio.sample_rate;
    let sessions: Vec<_> = registry
        .sessions_ordered()
        .iter()
        .map(|session| {
            json!({
                "id": session.id,
                "state": session.state().as_str(),
                "connected_at": session.connected_at.to_rfc3339(),
                "buffered_seconds": session.buffer.duration_seconds(sample_rate),
                "decoding": session.decoding()
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "count": sessions.len(),
        "sessions": sessions
    }))
}

pub async fn session_detail(
    path: web::Path<String>,
    state: web::Data<AppState>,
    registry: web::Data<Arc<SessionRegistry>>,
) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    let session = registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("no session with id '{}'", id)))?;

    let sample_rate = state.get_config().audio.sample_rate;
    // Transcript text is never persisted or exposed; lengths are enough for
    // an operator to see whether text is flowing.
    Ok(HttpResponse::Ok().json(json!({
        "id": session.id,
        "state": session.state().as_str(),
        "connected_at": session.connected_at.to_rfc3339(),
        "buffered_samples": session.buffer.len(),
        "buffered_seconds": session.buffer.duration_seconds(sample_rate),
        "decoding": session.decoding(),
        "pending_live_chars": session.last_live().chars().count(),
        "last_commit_chars": session.last_commit().chars().count()
    })))
}
