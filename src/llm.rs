//! Abstracción sobre Rig para embeddings e inferencia de chat.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.

use crate::config::{AppConfig, LlmProvider};
use anyhow::{anyhow, Result};
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use serde::Deserialize;
use tracing::warn;

/// Intención estructurada extraída de una pregunta por el LLM.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryIntent {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub refined_query: String,
}

/// Resultado del análisis de intención. Ambas ramas son explícitas: o el LLM
/// produjo un JSON válido, o se usó la heurística determinista de reserva.
#[derive(Debug, Clone)]
pub enum ParsedQuery {
    Parsed(QueryIntent),
    Fallback { keywords: Vec<String> },
}

impl ParsedQuery {
    /// Texto de búsqueda enriquecido: pregunta original más palabras clave y
    /// reformulación, cuando existen.
    pub fn search_text(&self, question: &str) -> String {
        let mut parts = vec![question.to_string()];
        match self {
            Self::Parsed(intent) => {
                parts.extend(intent.keywords.iter().cloned());
                if !intent.refined_query.is_empty() && intent.refined_query != question {
                    parts.push(intent.refined_query.clone());
                }
            }
            Self::Fallback { keywords } => {
                parts.extend(keywords.iter().cloned());
            }
        }
        parts.join(" ")
    }
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos, en una sola llamada al
    /// proveedor. Una lista vacía devuelve una lista vacía sin llamada.
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }

    /// Embedding de un único texto (consultas).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f64>> {
        let mut vectors = self.embed_texts(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("El proveedor no devolvió ningún embedding"))
    }

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        let client = openai::Client::from_env();

        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);
        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;

        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|emb| emb.vec).collect())
    }

    // ---------------------------------------------------------------------
    // ANÁLISIS DE INTENCIÓN
    // ---------------------------------------------------------------------

    /// Analiza la pregunta con el LLM para extraer intención, palabras clave y
    /// una reformulación. Nunca falla: ante cualquier error de llamada o de
    /// parseo devuelve la rama `Fallback` con la heurística determinista.
    pub async fn parse_intent(&self, question: &str, context_snippet: &str) -> ParsedQuery {
        let response = match self.provider {
            LlmProvider::OpenAI => self.parse_intent_with_openai(question, context_snippet).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        };

        let response = match response {
            Ok(text) => text,
            Err(err) => {
                warn!("Fallo del LLM analizando la pregunta: {err:#}. Se usa la heurística.");
                return ParsedQuery::Fallback {
                    keywords: extract_keywords(question),
                };
            }
        };

        let json_response = strip_code_fences(&response);
        match serde_json::from_str::<QueryIntent>(json_response) {
            Ok(intent) => ParsedQuery::Parsed(intent),
            Err(err) => {
                warn!(
                    "No se pudo parsear el JSON de intención. Error: {}. Respuesta LLM: '{}'",
                    err, response
                );
                ParsedQuery::Fallback {
                    keywords: extract_keywords(question),
                }
            }
        }
    }

    async fn parse_intent_with_openai(
        &self,
        question: &str,
        context_snippet: &str,
    ) -> Result<String> {
        use rig::providers::openai;
        use rig::client::CompletionClient as _;

        const INTENT_PROMPT: &str = r#"
Tu tarea es analizar una pregunta sobre un documento y extraer información útil para recuperar los pasajes relevantes.

La salida DEBE ser un único objeto JSON válido con tres claves:
- "intent": el tipo de pregunta (por ejemplo 'coverage_inquiry', 'waiting_period', 'definitions', 'specific_value', 'other').
- "keywords": lista de palabras clave útiles para la búsqueda.
- "refined_query": una reformulación más específica de la pregunta.

No incluyas explicaciones, solo el JSON.
"#;

        let client = openai::Client::from_env();
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let input = format!(
            "Pregunta: \"{}\"\n\nInicio del documento (para contexto): \"{}\"",
            question, context_snippet
        );

        let agent = client
            .agent(model_name)
            .preamble(INTENT_PROMPT)
            .build();

        let response = agent.prompt(input.as_str()).await?;
        Ok(response)
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    /// Genera una respuesta a partir de una pregunta y un contexto
    /// (concatenación de chunks relevantes etiquetados con su página).
    pub async fn answer_with_context(&self, question: &str, context: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.answer_with_openai(question, context).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        }
    }

    async fn answer_with_openai(&self, question: &str, context: &str) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        const SYSTEM_PROMPT: &str = r#"
Eres un analista experto en documentos.
Sólo puedes usar la información suministrada en el contexto; cada fragmento va etiquetado con su página de origen.
Cita las páginas en las que te apoyas con el formato [Página N].
Sé preciso con cifras, plazos y porcentajes cuando aparezcan.
Si el contexto no contiene la respuesta, di explícitamente que no la sabes.
Responde en el idioma de la pregunta.
"#;

        let client = openai::Client::from_env();

        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let full_context = format!(
            "Contexto:\n{}\n\nPregunta del usuario:\n{}",
            context, question
        );

        let agent = client
            .agent(model_name)
            .preamble(SYSTEM_PROMPT)
            .context(&full_context)
            .build();

        let answer = agent.prompt(question).await?;
        Ok(answer.trim().to_string())
    }
}

/// Heurística determinista de palabras clave: palabras alfanuméricas de más de
/// tres caracteres, en minúsculas, sin duplicados y en orden de aparición.
pub fn extract_keywords(question: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in question.split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() <= 3 {
            continue;
        }
        let lowered = word.to_lowercase();
        if !keywords.contains(&lowered) {
            keywords.push(lowered);
        }
    }
    keywords
}

/// Limpia la respuesta del LLM para asegurar que solo contenga el JSON.
fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_keywords_es_determinista_y_filtra_cortas() {
        let pregunta = "¿Cuál es el periodo de carencia del seguro, el periodo inicial?";
        let a = extract_keywords(pregunta);
        let b = extract_keywords(pregunta);
        assert_eq!(a, b);
        assert_eq!(a, vec!["cuál", "periodo", "carencia", "seguro", "inicial"]);
    }

    #[test]
    fn search_text_concatena_palabras_clave() {
        let parsed = ParsedQuery::Parsed(QueryIntent {
            intent: "waiting_period".to_string(),
            keywords: vec!["carencia".to_string(), "prima".to_string()],
            refined_query: "periodo de carencia para el pago de primas".to_string(),
        });
        let texto = parsed.search_text("¿Cuál es el periodo de carencia?");
        assert!(texto.starts_with("¿Cuál es el periodo de carencia?"));
        assert!(texto.contains("carencia"));
        assert!(texto.contains("periodo de carencia para el pago de primas"));
    }

    #[test]
    fn search_text_con_fallback_usa_la_heuristica() {
        let parsed = ParsedQuery::Fallback {
            keywords: extract_keywords("cobertura de cirugía de cataratas"),
        };
        let texto = parsed.search_text("cobertura de cirugía de cataratas");
        assert!(texto.contains("cobertura"));
        assert!(texto.contains("cataratas"));
    }

    #[test]
    fn strip_code_fences_limpia_bloques_markdown() {
        let raw = "```json\n{\"intent\": \"other\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"intent\": \"other\"}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }
}
