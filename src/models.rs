//! Modelos de dominio del pipeline (páginas, chunks y sus metadatos).

use serde::{Deserialize, Serialize};

/// Una página extraída del PDF, con su texto ya limpio.
/// Invariante: el texto nunca está vacío (las páginas vacías se descartan).
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Número de página, empezando en 1.
    pub number: usize,
    pub text: String,
    pub char_count: usize,
}

/// Trozo de texto atribuido a exactamente una página de origen.
/// Los offsets son posiciones en caracteres dentro del texto limpio de la página.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub page_number: usize,
    pub char_start: usize,
    pub char_end: usize,
}

/// Metadatos de un chunk tal y como viajan al índice vectorial.
/// Serializable porque el backend remoto los almacena junto al vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub content: String,
    pub page_number: usize,
    pub char_start: usize,
    pub char_end: usize,
}

impl From<&Chunk> for ChunkMeta {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            content: chunk.content.clone(),
            page_number: chunk.page_number,
            char_start: chunk.char_start,
            char_end: chunk.char_end,
        }
    }
}
