//! Carga y gestión de configuración de la aplicación (pipeline + LLM).

use std::env;
use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Backend del índice vectorial: exacto en memoria o Pinecone remoto.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    Memory,
    Pinecone,
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "memoria" => Ok(Self::Memory),
            "pinecone" => Ok(Self::Pinecone),
            other => Err(anyhow!("Backend vectorial no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación. Inmutable tras el arranque;
/// el pipeline recibe una copia en su construcción.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub vector_backend: VectorBackend,
    pub pinecone_api_key: Option<String>,
    pub pinecone_index_host: Option<String>,

    pub max_chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,

    pub top_k: usize,
    pub context_chunks: usize,

    pub download_max_retries: u32,
    pub download_timeout_secs: u64,
    pub download_max_bytes: usize,

    pub max_pages: usize,
    pub max_total_chars: usize,

    pub max_questions: usize,
    pub question_delay_secs: u64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8001".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let vector_backend_str =
            env::var("VECTOR_BACKEND").unwrap_or_else(|_| "memory".to_string());
        let vector_backend = VectorBackend::from_str(&vector_backend_str)?;

        let pinecone_api_key = env::var("PINECONE_API_KEY").ok();
        let pinecone_index_host = env::var("PINECONE_INDEX_HOST").ok();

        if vector_backend == VectorBackend::Pinecone
            && (pinecone_api_key.is_none() || pinecone_index_host.is_none())
        {
            return Err(anyhow!(
                "VECTOR_BACKEND=pinecone requiere PINECONE_API_KEY y PINECONE_INDEX_HOST"
            ));
        }

        Ok(Self {
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            vector_backend,
            pinecone_api_key,
            pinecone_index_host,
            max_chunk_size: env_usize("CHUNK_SIZE", 1200)?,
            chunk_overlap: env_usize("CHUNK_OVERLAP", 120)?,
            min_chunk_chars: env_usize("MIN_CHUNK_CHARS", 50)?,
            top_k: env_usize("TOP_K", 10)?,
            context_chunks: env_usize("CONTEXT_CHUNKS", 3)?,
            download_max_retries: env_usize("DOWNLOAD_MAX_RETRIES", 3)? as u32,
            download_timeout_secs: env_usize("DOWNLOAD_TIMEOUT_SECS", 180)? as u64,
            download_max_bytes: env_usize("DOWNLOAD_MAX_BYTES", 200 * 1024 * 1024)?,
            max_pages: env_usize("MAX_PAGES", 200)?,
            max_total_chars: env_usize("MAX_TOTAL_CHARS", 100_000)?,
            max_questions: env_usize("MAX_QUESTIONS", 20)?,
            question_delay_secs: env_usize("QUESTION_DELAY_SECS", 0)? as u64,
        })
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("Valor no numérico en {name}: {raw}")),
        Err(_) => Ok(default),
    }
}
