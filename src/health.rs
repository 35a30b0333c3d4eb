use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "rejected": metrics.rejected_sessions
        },
        // Whether each key is present; the keys themselves are never returned
        "providers": {
            "stt": provider_status(state.providers.stt.name(), &config.providers.stt.api_key),
            "llm": provider_status(state.providers.llm.name(), &config.providers.llm.api_key),
            "tts": provider_status(state.providers.tts.name(), &config.providers.tts.api_key)
        },
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "rejected": metrics.rejected_sessions,
            "sessions_per_hour": if uptime_seconds > 0 {
                metrics.total_sessions as f64 * 3600.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "conversation": {
            "completed_turns": metrics.completed_turns,
            "interrupts": metrics.interrupts,
            "interrupt_rate": if metrics.completed_turns + metrics.interrupts > 0 {
                metrics.interrupts as f64 / (metrics.completed_turns + metrics.interrupts) as f64
            } else {
                0.0
            }
        },
        "errors": {
            "provider_errors": metrics.provider_errors,
            "dropped_audio_frames": metrics.dropped_audio_frames,
            "malformed_messages": metrics.malformed_messages
        },
        "performance": {
            "max_concurrent_sessions": state.get_config().performance.max_concurrent_sessions
        }
    }))
}

fn provider_status(name: &str, api_key: &str) -> serde_json::Value {
    json!({
        "name": name,
        "configured": !api_key.trim().is_empty()
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "full"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions
    })
}
