//! Taxonomía de errores del pipeline. Cada variante lleva una categoría
//! distinguible por máquina que la capa HTTP traduce a un código de estado.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fallo descargando el documento origen tras agotar los reintentos.
    #[error("Error de descarga: {0}")]
    Download(String),

    /// Fallo duro de extracción (la ruta blanda devuelve un centinela, no este error).
    #[error("Error de extracción: {0}")]
    Extraction(String),

    /// Fallo de inferencia de embeddings sobre los chunks del documento.
    #[error("Error de embeddings: {0}")]
    Embedding(String),

    /// Dimensión incompatible o fallo del backend vectorial durante la petición.
    #[error("Error del índice vectorial: {0}")]
    Index(String),

    /// Fallo del LLM generando la respuesta. Se recupera localmente con la
    /// respuesta determinista de reserva; nunca llega a la capa HTTP.
    #[error("Error de síntesis: {0}")]
    Synthesis(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Categoría estable para clientes externos.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Download(_) => "download_error",
            Self::Extraction(_) => "extraction_error",
            Self::Embedding(_) => "embedding_error",
            Self::Index(_) => "index_error",
            Self::Synthesis(_) => "synthesis_error",
            Self::Other(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorias_estables() {
        assert_eq!(
            PipelineError::Download("x".into()).category(),
            "download_error"
        );
        assert_eq!(
            PipelineError::Index("dim".into()).category(),
            "index_error"
        );
        let interno: PipelineError = anyhow::anyhow!("algo").into();
        assert_eq!(interno.category(), "internal_error");
    }
}
