//! Capa HTTP: payloads, validación de entrada, router y mapeo de categorías
//! de error a códigos de estado.

use std::time::Instant;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use url::Url;

use crate::{app_state::AppState, error::PipelineError};

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct QueryPayload {
    /// URL http/https del documento PDF a procesar.
    documents: String,
    questions: Vec<String>,
}

#[derive(Serialize)]
pub struct QueryResponse {
    answers: Vec<String>,
    success: bool,
    processing_time: f64,
    timestamp: f64,
    confidence_scores: Vec<f64>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/v1/query", post(query_handler))
        .route("/api/v1/run", post(query_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "message": "Servicio de preguntas y respuestas sobre documentos PDF",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/api/health", "/api/status", "/api/v1/query"],
    }))
}

#[axum::debug_handler]
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": now_unix() }))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "operational",
        "timestamp": now_unix(),
        "components": state.pipeline.status(),
    }))
}

#[axum::debug_handler]
async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<serde_json::Value>)> {
    let start = Instant::now();

    if let Err(detail) = validate_request(&payload, state.config.max_questions) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "detail": detail})),
        ));
    }

    info!(
        "Procesando petición con {} preguntas",
        payload.questions.len()
    );

    match state
        .pipeline
        .process(&payload.documents, &payload.questions)
        .await
    {
        Ok(outcome) => {
            let processing_time = start.elapsed().as_secs_f64();
            info!("Petición procesada en {processing_time:.2} segundos");
            Ok(Json(QueryResponse {
                answers: outcome.answers,
                success: true,
                processing_time,
                timestamp: now_unix(),
                confidence_scores: outcome.confidence_scores,
            }))
        }
        Err(err) => {
            error!("Error procesando la petición: {err}");
            Err((
                status_for(&err),
                Json(json!({"error": err.category(), "detail": err.to_string()})),
            ))
        }
    }
}

// --- Validación y utilidades ---

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Download(_) => StatusCode::BAD_REQUEST,
        PipelineError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn validate_request(payload: &QueryPayload, max_questions: usize) -> Result<(), String> {
    validate_document_url(&payload.documents)?;

    if payload.questions.is_empty() {
        return Err("Se requiere al menos una pregunta.".to_string());
    }
    if payload.questions.len() > max_questions {
        return Err(format!(
            "Máximo {max_questions} preguntas por petición."
        ));
    }
    if payload.questions.iter().any(|q| q.trim().is_empty()) {
        return Err("Las preguntas no pueden estar vacías.".to_string());
    }
    Ok(())
}

fn validate_document_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|_| "La URL del documento no es válida.".to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("Esquema de URL no soportado: {other}")),
    }
}

fn now_unix() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(documents: &str, questions: &[&str]) -> QueryPayload {
        QueryPayload {
            documents: documents.to_string(),
            questions: questions.iter().map(|q| q.to_string()).collect(),
        }
    }

    #[test]
    fn acepta_urls_http_y_https() {
        assert!(validate_document_url("https://ejemplo.com/doc.pdf").is_ok());
        assert!(validate_document_url("http://ejemplo.com/doc.pdf").is_ok());
    }

    #[test]
    fn rechaza_urls_invalidas_o_de_otro_esquema() {
        assert!(validate_document_url("no es una url").is_err());
        assert!(validate_document_url("ftp://ejemplo.com/doc.pdf").is_err());
        assert!(validate_document_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn valida_el_numero_de_preguntas() {
        let ok = payload("https://ejemplo.com/doc.pdf", &["¿Qué cubre la póliza?"]);
        assert!(validate_request(&ok, 20).is_ok());

        let vacio = payload("https://ejemplo.com/doc.pdf", &[]);
        assert!(validate_request(&vacio, 20).is_err());

        let preguntas: Vec<String> = (0..21).map(|i| format!("pregunta {i}")).collect();
        let refs: Vec<&str> = preguntas.iter().map(|s| s.as_str()).collect();
        let demasiadas = payload("https://ejemplo.com/doc.pdf", &refs);
        assert!(validate_request(&demasiadas, 20).is_err());
    }

    #[test]
    fn rechaza_preguntas_en_blanco() {
        let en_blanco = payload("https://ejemplo.com/doc.pdf", &["válida", "   "]);
        assert!(validate_request(&en_blanco, 20).is_err());
    }

    #[test]
    fn mapea_categorias_a_codigos_de_estado() {
        assert_eq!(
            status_for(&PipelineError::Download("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::Extraction("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&PipelineError::Embedding("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
