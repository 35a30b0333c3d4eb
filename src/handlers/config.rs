use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as returned by the API: provider keys are replaced by a presence flag.
fn redacted(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "providers": {
            "stt": {
                "api_url": config.providers.stt.api_url,
                "api_key_configured": !config.providers.stt.api_key.is_empty()
            },
            "llm": {
                "api_url": config.providers.llm.api_url,
                "api_key_configured": !config.providers.llm.api_key.is_empty()
            },
            "tts": {
                "api_url": config.providers.tts.api_url,
                "api_key_configured": !config.providers.tts.api_key.is_empty(),
                "version": config.providers.tts.version
            }
        },
        "defaults": config.defaults,
        "interruption": config.interruption,
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)
    })))
}

/// Partial update; applies to sessions that start afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)
    })))
}
