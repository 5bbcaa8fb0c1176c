use std::sync::Arc;
use crate::{config::AppConfig, rag::QueryPipeline};

/// Estado compartido entre handlers: configuración inmutable y el pipeline
/// construido en el arranque, ambos de sólo lectura.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<QueryPipeline>,
}
