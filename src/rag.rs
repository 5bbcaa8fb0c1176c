//! Orquestación del pipeline de preguntas sobre un documento.
//!
//! Flujo por petición:
//!   1. Descarga del PDF y extracción del texto por páginas.
//!   2. Troceado en chunks y embeddings en bloque.
//!   3. Población de un índice vectorial con vida de petición.
//!   4. Por cada pregunta, en orden: análisis de intención → recuperación →
//!      síntesis con el LLM, con reserva determinista ante cualquier fallo.
//!   5. Vaciado del índice antes de devolver la respuesta.
//!
//! El fallo de una pregunta nunca aborta las demás; el fallo de las fases
//! compartidas (descarga, embeddings, índice) aborta la petición completa.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    chunk::Chunker,
    config::AppConfig,
    download::DocumentFetcher,
    error::PipelineError,
    extract::{ExtractionOutcome, TextExtractor},
    llm::LlmManager,
    models::ChunkMeta,
    vector_store::{IndexBackend, IndexSession},
};

/// Caracteres del mejor chunk incluidos en la respuesta de reserva.
const FALLBACK_EXCERPT_CHARS: usize = 300;

/// Caracteres del inicio del documento pasados al análisis de intención.
const INTENT_CONTEXT_CHARS: usize = 500;

/// Respuesta centinela cuando ninguna estrategia de extracción produjo texto.
const EXTRACTION_FAILED_ANSWER: &str =
    "No se pudo extraer texto de este documento. Puede estar dañado, protegido \
     con contraseña o en un formato no soportado; pruebe con otro documento.";

/// Respuesta cuando la recuperación no encuentra nada relevante.
const NO_RELEVANT_ANSWER: &str =
    "El documento proporcionado no contiene información relevante para esta pregunta.";

/// Resultado de procesar una petición completa.
pub struct RequestOutcome {
    pub answers: Vec<String>,
    pub confidence_scores: Vec<f64>,
}

#[derive(Serialize)]
pub struct EmbedderStatus {
    pub model: String,
    pub dimension: usize,
}

#[derive(Serialize)]
pub struct VectorStoreStatus {
    pub backend: &'static str,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct LlmStatus {
    pub model: String,
    pub status: &'static str,
}

/// Estado de preparación de cada etapa, para el endpoint de monitorización.
#[derive(Serialize)]
pub struct PipelineStatus {
    pub extractor: &'static str,
    pub embedder: EmbedderStatus,
    pub vector_store: VectorStoreStatus,
    pub llm: LlmStatus,
}

/// Pipeline construido explícitamente en el arranque con configuración
/// inmutable. Compartido entre peticiones en modo sólo-lectura; el índice
/// vectorial de cada petición es exclusivo de esa petición.
pub struct QueryPipeline {
    config: AppConfig,
    fetcher: DocumentFetcher,
    extractor: TextExtractor,
    chunker: Chunker,
    llm: LlmManager,
    backend: IndexBackend,
    dimension: usize,
}

impl QueryPipeline {
    /// Construye el pipeline y sondea el modelo de embeddings para fijar la
    /// dimensión. Un fallo de la sonda es fatal en el arranque.
    pub async fn new(cfg: &AppConfig) -> Result<Self> {
        let fetcher = DocumentFetcher::from_config(cfg)?;
        let extractor = TextExtractor::from_config(cfg)?;
        let chunker = Chunker::from_config(cfg);
        let llm = LlmManager::from_config(cfg)?;

        let probe = llm
            .embed_texts(vec!["ping".to_string()])
            .await
            .context("No se pudo sondear el modelo de embeddings")?;
        let dimension = probe.first().map(|v| v.len()).unwrap_or(0);
        anyhow::ensure!(
            dimension > 0,
            "El modelo de embeddings devolvió un vector de dimensión 0"
        );
        info!(
            "Modelo de embeddings '{}' cargado con dimensión {dimension}",
            cfg.llm_embedding_model
        );

        let backend = IndexBackend::from_config(cfg, dimension).await;

        Ok(Self {
            config: cfg.clone(),
            fetcher,
            extractor,
            chunker,
            llm,
            backend,
            dimension,
        })
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            extractor: "ready",
            embedder: EmbedderStatus {
                model: self.config.llm_embedding_model.clone(),
                dimension: self.dimension,
            },
            vector_store: VectorStoreStatus {
                backend: self.backend.kind(),
                status: "ready",
            },
            llm: LlmStatus {
                model: self.config.llm_chat_model.clone(),
                status: "ready",
            },
        }
    }

    /// Procesa un documento y responde a todas las preguntas, en orden.
    /// Garantiza una respuesta por pregunta cuando la petición no aborta.
    pub async fn process(
        &self,
        url: &str,
        questions: &[String],
    ) -> Result<RequestOutcome, PipelineError> {
        let bytes = self.fetcher.fetch(url).await?;

        info!("Extrayendo texto del documento ({} bytes)...", bytes.len());
        let pages = match self.extractor.extract(&bytes) {
            ExtractionOutcome::Pages(pages) => pages,
            ExtractionOutcome::NoText => {
                warn!("Extracción sin texto útil; se degrada la petición completa");
                return Ok(degraded_outcome(questions.len()));
            }
        };

        let chunks = self.chunker.chunk(&pages);
        if chunks.is_empty() {
            warn!("El troceado no produjo ningún chunk útil; se degrada la petición");
            return Ok(degraded_outcome(questions.len()));
        }
        info!(
            "Documento troceado: {} páginas, {} chunks",
            pages.len(),
            chunks.len()
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .llm
            .embed_texts(texts)
            .await
            .map_err(|e| PipelineError::Embedding(format!("{e:#}")))?;

        let metas: Vec<ChunkMeta> = chunks.iter().map(ChunkMeta::from).collect();
        let mut index = self.backend.session(self.dimension);
        index.add(vectors, metas.clone()).await?;

        let head_context = document_head(&metas, INTENT_CONTEXT_CHARS);

        let mut answers = Vec::with_capacity(questions.len());
        let mut confidence_scores = Vec::with_capacity(questions.len());

        for (i, question) in questions.iter().enumerate() {
            // Pausa opcional entre preguntas para respetar cuotas del proveedor.
            if i > 0 && self.config.question_delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.config.question_delay_secs)).await;
            }
            info!("Procesando pregunta {}/{}", i + 1, questions.len());

            let (answer, confidence) = self
                .answer_question(&index, &metas, question, &head_context)
                .await;
            answers.push(answer);
            confidence_scores.push(confidence);
        }

        if let Err(err) = index.clear().await {
            warn!("No se pudo vaciar el índice de la petición: {err}");
        }

        Ok(RequestOutcome {
            answers,
            confidence_scores,
        })
    }

    /// Responde a una sola pregunta. Nunca devuelve error: cualquier fallo se
    /// resuelve con la recuperación por palabras clave o con la respuesta de
    /// reserva determinista.
    async fn answer_question(
        &self,
        index: &IndexSession,
        metas: &[ChunkMeta],
        question: &str,
        head_context: &str,
    ) -> (String, f64) {
        let parsed = self.llm.parse_intent(question, head_context).await;
        let search_text = parsed.search_text(question);

        let ranked = match self.llm.embed_one(&search_text).await {
            Ok(query_vector) => match index.search(&query_vector, self.config.top_k).await {
                Ok(results) => results,
                Err(err) => {
                    warn!("Fallo del índice vectorial ({err}); recuperación por palabras clave");
                    keyword_rank(metas, question, self.config.top_k)
                }
            },
            Err(err) => {
                warn!("Fallo del embedding de la consulta ({err:#}); recuperación por palabras clave");
                keyword_rank(metas, question, self.config.top_k)
            }
        };

        if ranked.is_empty() {
            return (NO_RELEVANT_ANSWER.to_string(), 0.0);
        }

        let context = build_context(&ranked, self.config.context_chunks);
        match self.llm.answer_with_context(question, &context).await {
            Ok(answer) => {
                let confidence = confidence_score(&answer, question, &context);
                (answer, confidence)
            }
            Err(err) => {
                let err = PipelineError::Synthesis(format!("{err:#}"));
                warn!("{err}; se usa la respuesta de reserva determinista");
                (fallback_answer(&ranked[0].0), 0.0)
            }
        }
    }
}

/// Respuesta degradada: una respuesta centinela por pregunta, en orden.
fn degraded_outcome(question_count: usize) -> RequestOutcome {
    RequestOutcome {
        answers: vec![EXTRACTION_FAILED_ANSWER.to_string(); question_count],
        confidence_scores: vec![0.0; question_count],
    }
}

/// Inicio del documento para dar contexto al análisis de intención.
fn document_head(metas: &[ChunkMeta], max_chars: usize) -> String {
    let joined = metas
        .iter()
        .take(3)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    excerpt(&joined, max_chars).to_string()
}

/// Contexto del prompt: los mejores chunks etiquetados con su página.
fn build_context(ranked: &[(ChunkMeta, f64)], max_chunks: usize) -> String {
    ranked
        .iter()
        .take(max_chunks)
        .map(|(meta, _)| {
            format!(
                "[Fragmento {}, Página {}]: {}",
                meta.chunk_id, meta.page_number, meta.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Respuesta determinista de reserva construida desde el mejor chunk.
fn fallback_answer(best: &ChunkMeta) -> String {
    let excerpt_text = excerpt(&best.content, FALLBACK_EXCERPT_CHARS);
    let suffix = if excerpt_text.len() < best.content.len() {
        "..."
    } else {
        ""
    };
    format!(
        "Según el contenido del documento [Página {}], la información relevante encontrada es: {}{}",
        best.page_number, excerpt_text, suffix
    )
}

/// Recuperación determinista por solapamiento de palabras clave, usada cuando
/// el embedding de la consulta o el índice fallan para una pregunta.
fn keyword_rank(metas: &[ChunkMeta], question: &str, top_k: usize) -> Vec<(ChunkMeta, f64)> {
    let question_words = words_of(question);
    if question_words.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f64)> = metas
        .iter()
        .enumerate()
        .map(|(idx, meta)| {
            let content_lower = meta.content.to_lowercase();
            let chunk_words = words_of(&meta.content);
            let mut overlap = question_words
                .iter()
                .filter(|w| chunk_words.contains(*w))
                .count() as f64;
            // Bono por palabras largas presentes como subcadena.
            for word in &question_words {
                if word.chars().count() > 3 && content_lower.contains(word.as_str()) {
                    overlap += 1.0;
                }
            }
            (idx, overlap)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|(idx, score)| (metas[idx].clone(), score))
        .collect()
}

/// Señal de confianza heurística y no normativa en [0, 1]: combina longitud,
/// densidad de palabras clave y presencia de frases de cita.
fn confidence_score(answer: &str, question: &str, context: &str) -> f64 {
    let answer_chars = answer.chars().count();
    if answer.is_empty() || answer_chars < 20 {
        return 0.0;
    }

    let mut confidence = 0.0;
    let answer_lower = answer.to_lowercase();

    if answer_chars > 50 {
        confidence += 0.2;
    }

    let specific_indicators = ["%", "página", "sección", "cláusula", "artículo", "plazo"];
    let specific_count = specific_indicators
        .iter()
        .filter(|ind| answer_lower.contains(**ind))
        .count() as f64;
    confidence += (specific_count / 5.0).min(0.3);

    let question_words = words_of(question);
    if !question_words.is_empty() {
        let answer_words = words_of(answer);
        let overlap = question_words
            .iter()
            .filter(|w| answer_words.contains(*w))
            .count() as f64;
        confidence += (overlap / question_words.len() as f64).min(0.3);
    }

    let citation_phrases = ["según", "documento", "menciona", "indica"];
    if !context.is_empty()
        && citation_phrases
            .iter()
            .any(|phrase| answer_lower.contains(phrase))
    {
        confidence += 0.2;
    }

    confidence.min(1.0)
}

fn words_of(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Prefijo de como mucho `max_chars` caracteres, seguro para UTF-8.
fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, page: usize, content: &str) -> ChunkMeta {
        ChunkMeta {
            chunk_id: id.to_string(),
            content: content.to_string(),
            page_number: page,
            char_start: 0,
            char_end: content.chars().count(),
        }
    }

    #[test]
    fn la_respuesta_degradada_cubre_todas_las_preguntas() {
        let outcome = degraded_outcome(3);
        assert_eq!(outcome.answers.len(), 3);
        assert_eq!(outcome.confidence_scores, vec![0.0, 0.0, 0.0]);
        assert!(outcome
            .answers
            .iter()
            .all(|a| a.contains("No se pudo extraer texto")));
    }

    #[test]
    fn la_respuesta_de_reserva_cita_la_pagina_y_recorta() {
        let contenido = "x".repeat(500);
        let best = meta("chunk_7", 12, &contenido);
        let answer = fallback_answer(&best);

        assert!(answer.contains("[Página 12]"));
        assert!(answer.ends_with("..."));
        // 300 caracteres del chunk, ni uno más.
        assert!(answer.contains(&"x".repeat(300)));
        assert!(!answer.contains(&"x".repeat(301)));
    }

    #[test]
    fn la_respuesta_de_reserva_no_recorta_chunks_cortos() {
        let best = meta("chunk_0", 2, "Texto breve del documento.");
        let answer = fallback_answer(&best);
        assert!(answer.contains("Texto breve del documento."));
        assert!(!answer.ends_with("..."));
    }

    #[test]
    fn keyword_rank_ordena_por_solapamiento() {
        let metas = vec![
            meta("a", 1, "Este fragmento habla de primas y pagos del seguro."),
            meta("b", 2, "Aquí se define el periodo de carencia del seguro médico."),
            meta("c", 3, "Contenido sin relación alguna con la consulta."),
        ];
        let ranked = keyword_rank(&metas, "¿Cuál es el periodo de carencia?", 10);

        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].0.chunk_id, "b");
        assert!(ranked.windows(2).all(|p| p[0].1 >= p[1].1));
    }

    #[test]
    fn keyword_rank_es_determinista() {
        let metas = vec![
            meta("a", 1, "primas y pagos del seguro"),
            meta("b", 2, "periodo de carencia del seguro"),
        ];
        let x = keyword_rank(&metas, "periodo de carencia", 5);
        let y = keyword_rank(&metas, "periodo de carencia", 5);
        assert_eq!(x.len(), y.len());
        for (a, b) in x.iter().zip(y.iter()) {
            assert_eq!(a.0.chunk_id, b.0.chunk_id);
            assert_eq!(a.1, b.1);
        }
    }

    #[test]
    fn build_context_etiqueta_paginas_y_limita_chunks() {
        let ranked = vec![
            (meta("chunk_0", 4, "Primer fragmento."), 0.9),
            (meta("chunk_1", 9, "Segundo fragmento."), 0.7),
            (meta("chunk_2", 1, "Tercer fragmento."), 0.5),
        ];
        let context = build_context(&ranked, 2);

        assert!(context.contains("[Fragmento chunk_0, Página 4]"));
        assert!(context.contains("[Fragmento chunk_1, Página 9]"));
        assert!(!context.contains("chunk_2"));
    }

    #[test]
    fn la_confianza_esta_acotada() {
        assert_eq!(confidence_score("", "pregunta", "contexto"), 0.0);
        assert_eq!(confidence_score("corta", "pregunta", "contexto"), 0.0);

        let answer = "Según el documento, el periodo de carencia es de treinta días \
                      tal y como se indica en la sección cuarta [Página 3].";
        let score = confidence_score(answer, "¿Cuál es el periodo de carencia?", "contexto");
        assert!(score > 0.0);
        assert!(score <= 1.0);
    }

    #[test]
    fn excerpt_es_seguro_con_utf8() {
        let text = "áéíóú".repeat(100);
        let cut = excerpt(&text, 7);
        assert_eq!(cut.chars().count(), 7);
        assert_eq!(excerpt("corto", 300), "corto");
    }
}
