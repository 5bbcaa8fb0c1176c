//! Extracción de texto por páginas desde los bytes del PDF.
//!
//! Escalera de estrategias:
//!   1. `pdf-extract` sobre el documento completo, página a página.
//!   2. `lopdf` página a página, tolerando fallos de páginas individuales.
//!   3. `pdf-extract` sobre un prefijo truncado del documento.
//! Si ninguna produce texto útil se devuelve un centinela, no un error,
//! para que el pipeline degrade la petición en lugar de abortarla.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::Page;

/// Prefijo de bytes usado en el intento parcial sobre PDFs problemáticos.
const PARTIAL_PREFIX_BYTES: usize = 50 * 1024 * 1024;

/// Longitud mínima de línea; por debajo se considera artefacto de maquetación.
const MIN_LINE_CHARS: usize = 4;

#[derive(Debug)]
pub enum ExtractionOutcome {
    Pages(Vec<Page>),
    /// Ninguna estrategia produjo texto útil.
    NoText,
}

pub struct TextExtractor {
    max_pages: usize,
    max_total_chars: usize,
    re_spaces: Regex,
}

impl TextExtractor {
    pub fn new(max_pages: usize, max_total_chars: usize) -> Result<Self> {
        Ok(Self {
            max_pages,
            max_total_chars,
            re_spaces: Regex::new(r"[ \t]+").context("Regex de espacios inválida")?,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(cfg.max_pages, cfg.max_total_chars)
    }

    /// Extrae las páginas con texto útil del PDF.
    pub fn extract(&self, bytes: &[u8]) -> ExtractionOutcome {
        match self.pages_with_pdf_extract(bytes) {
            Ok(pages) if !pages.is_empty() => {
                info!("Extraídas {} páginas con pdf-extract", pages.len());
                return ExtractionOutcome::Pages(pages);
            }
            Ok(_) => warn!("pdf-extract no produjo texto útil; probando lopdf"),
            Err(err) => warn!("pdf-extract falló: {err:#}; probando lopdf"),
        }

        match self.pages_with_lopdf(bytes) {
            Ok(pages) if !pages.is_empty() => {
                info!("Extraídas {} páginas con lopdf (estrategia alternativa)", pages.len());
                return ExtractionOutcome::Pages(pages);
            }
            Ok(_) => warn!("lopdf no produjo texto útil"),
            Err(err) => warn!("lopdf falló: {err:#}"),
        }

        // Último intento: prefijo truncado, por si la cola del fichero está corrupta.
        if bytes.len() > PARTIAL_PREFIX_BYTES {
            let prefix = &bytes[..PARTIAL_PREFIX_BYTES];
            match self.pages_with_pdf_extract(prefix) {
                Ok(pages) if !pages.is_empty() => {
                    info!(
                        "Extracción parcial sobre prefijo truncado: {} páginas",
                        pages.len()
                    );
                    return ExtractionOutcome::Pages(pages);
                }
                Ok(_) => warn!("La extracción parcial no produjo texto útil"),
                Err(err) => warn!("La extracción parcial falló: {err:#}"),
            }
        }

        warn!("Todas las estrategias de extracción fallaron para este documento");
        ExtractionOutcome::NoText
    }

    fn pages_with_pdf_extract(&self, bytes: &[u8]) -> Result<Vec<Page>, PipelineError> {
        let raw_pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| {
            PipelineError::Extraction(format!("pdf-extract no pudo procesar el documento: {e}"))
        })?;
        Ok(self.build_pages(
            raw_pages
                .into_iter()
                .enumerate()
                .map(|(idx, text)| (idx + 1, text)),
        ))
    }

    fn pages_with_lopdf(&self, bytes: &[u8]) -> Result<Vec<Page>, PipelineError> {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| {
            PipelineError::Extraction(format!("lopdf no pudo cargar el documento: {e}"))
        })?;
        let numbers: Vec<u32> = doc.get_pages().keys().copied().collect();

        let mut raw = Vec::new();
        for number in numbers {
            match doc.extract_text(&[number]) {
                Ok(text) => raw.push((number as usize, text)),
                Err(err) => warn!("No se pudo extraer la página {number}: {err}"),
            }
        }
        Ok(self.build_pages(raw))
    }

    /// Limpia, filtra páginas vacías y aplica los topes de páginas y caracteres.
    fn build_pages(&self, raw: impl IntoIterator<Item = (usize, String)>) -> Vec<Page> {
        let mut pages = Vec::new();
        let mut total_chars = 0usize;

        for (number, text) in raw {
            if pages.len() >= self.max_pages {
                info!("Alcanzado el tope de {} páginas", self.max_pages);
                break;
            }

            let cleaned = self.clean_text(&text);
            if cleaned.is_empty() {
                continue;
            }

            let char_count = cleaned.chars().count();
            total_chars += char_count;
            pages.push(Page {
                number,
                text: cleaned,
                char_count,
            });

            if total_chars > self.max_total_chars {
                info!(
                    "Alcanzado el tope de {} caracteres en la página {number}",
                    self.max_total_chars
                );
                break;
            }
        }

        pages
    }

    /// Normaliza el texto extraído: colapsa espacios, elimina saltos de página
    /// y descarta líneas-artefacto, preservando los límites de párrafo.
    fn clean_text(&self, raw: &str) -> String {
        let unformfed = raw.replace('\u{c}', "\n");
        let collapsed = self.re_spaces.replace_all(&unformfed, " ");

        let mut out = String::new();
        let mut pending_break = false;

        for line in collapsed.lines() {
            let line = line.trim();
            if line.is_empty() {
                pending_break = true;
                continue;
            }
            // Números de página sueltos y restos de maquetación.
            if line.chars().count() < MIN_LINE_CHARS
                || line.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            if !out.is_empty() {
                out.push_str(if pending_break { "\n\n" } else { "\n" });
            }
            pending_break = false;
            out.push_str(line);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> TextExtractor {
        TextExtractor::new(200, 100_000).unwrap()
    }

    #[test]
    fn limpia_espacios_y_artefactos() {
        let raw = "Primera   línea  con \t espacios\n\n42\n\nSegunda línea útil\nok\n";
        let cleaned = extractor().clean_text(raw);
        assert_eq!(
            cleaned,
            "Primera línea con espacios\n\nSegunda línea útil"
        );
    }

    #[test]
    fn preserva_limites_de_parrafo() {
        let raw = "Párrafo uno, línea uno\nlínea dos\n\n\n\nPárrafo dos\n";
        let cleaned = extractor().clean_text(raw);
        assert_eq!(cleaned, "Párrafo uno, línea uno\nlínea dos\n\nPárrafo dos");
    }

    #[test]
    fn convierte_saltos_de_pagina_en_nueva_linea() {
        let raw = "Texto antes del salto\u{c}Texto después del salto";
        let cleaned = extractor().clean_text(raw);
        assert_eq!(cleaned, "Texto antes del salto\nTexto después del salto");
    }

    #[test]
    fn descarta_paginas_vacias_y_respeta_topes() {
        let ex = TextExtractor::new(2, 100_000).unwrap();
        let raw = vec![
            (1, "Contenido de la primera página del documento".to_string()),
            (2, "   \n 7 \n".to_string()),
            (3, "Contenido de la tercera página del documento".to_string()),
            (4, "Nunca debería procesarse por el tope de páginas".to_string()),
        ];
        let pages = ex.build_pages(raw);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        // La página 2 se descarta por vacía; la 3 conserva su número real.
        assert_eq!(pages[1].number, 3);
        assert!(pages.iter().all(|p| p.char_count > 0));
    }

    #[test]
    fn corta_al_alcanzar_el_tope_de_caracteres() {
        let ex = TextExtractor::new(200, 40).unwrap();
        let raw = vec![
            (1, "Una página con bastante texto de relleno variado".to_string()),
            (2, "Otra página que ya no debería entrar".to_string()),
        ];
        let pages = ex.build_pages(raw);
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn bytes_invalidos_devuelven_centinela() {
        let outcome = extractor().extract(b"esto no es un pdf");
        assert!(matches!(outcome, ExtractionOutcome::NoText));
    }
}
