//! Troceado del texto de cada página en chunks solapados y acotados.
//!
//! Acumula párrafos hasta el tamaño máximo; al sellar un chunk, el siguiente
//! arranca con la cola del anterior (recortada al último fin de frase cuando
//! existe pasada la mitad de la cola). Los párrafos que por sí solos superan
//! el máximo se trocean en rebanadas fijas. Todas las medidas son en
//! caracteres y el resultado es determinista.

use crate::config::AppConfig;
use crate::models::{Chunk, Page};

pub struct Chunker {
    max_chunk_size: usize,
    overlap_size: usize,
    min_chunk_chars: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap_size: usize, min_chunk_chars: usize) -> Self {
        Self {
            // Un máximo de 0 degeneraría el troceado; se fuerza al menos 1.
            max_chunk_size: max_chunk_size.max(1),
            overlap_size,
            min_chunk_chars,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.max_chunk_size, cfg.chunk_overlap, cfg.min_chunk_chars)
    }

    /// Trocea todas las páginas en orden. Los identificadores de chunk son
    /// secuenciales sobre el documento completo.
    pub fn chunk(&self, pages: &[Page]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut next_id = 0usize;
        for page in pages {
            self.chunk_page(page, &mut chunks, &mut next_id);
        }
        chunks
    }

    fn chunk_page(&self, page: &Page, out: &mut Vec<Chunk>, next_id: &mut usize) {
        let mut offset = 0usize;
        let mut current = String::new();
        let mut current_start = 0usize;

        for para in page.text.split("\n\n") {
            let para_offset = offset;
            let para_len = char_len(para);
            offset += para_len + 2;

            if para.is_empty() {
                continue;
            }

            // Párrafo gigante: se sella lo acumulado y se trocea en rebanadas fijas.
            if para_len > self.max_chunk_size {
                if !current.is_empty() {
                    self.emit(out, next_id, &current, page.number, current_start);
                    current.clear();
                }
                let mut slice_start = 0usize;
                while slice_start < para_len {
                    let slice_end = (slice_start + self.max_chunk_size).min(para_len);
                    let slice = slice_chars(para, slice_start, slice_end);
                    self.emit(out, next_id, slice, page.number, para_offset + slice_start);
                    slice_start = slice_end;
                }
                continue;
            }

            if current.is_empty() {
                current = para.to_string();
                current_start = para_offset;
                continue;
            }

            if char_len(&current) + 2 + para_len > self.max_chunk_size {
                let sealed_end = current_start + char_len(&current);
                self.emit(out, next_id, &current, page.number, current_start);

                let seed = self.overlap_tail(&current);
                let seed_len = char_len(&seed);
                // La semilla se descarta si junto al párrafo rompería el máximo.
                if seed_len == 0 || seed_len + 2 + para_len > self.max_chunk_size {
                    current = para.to_string();
                    current_start = para_offset;
                } else {
                    current_start = sealed_end - seed_len;
                    current = format!("{seed}\n\n{para}");
                }
            } else {
                current.push_str("\n\n");
                current.push_str(para);
            }
        }

        if !current.is_empty() {
            self.emit(out, next_id, &current, page.number, current_start);
        }
    }

    /// Cola de solape del buffer sellado: los últimos `overlap_size` caracteres,
    /// recortados al último terminador de frase si aparece pasada la mitad.
    fn overlap_tail(&self, text: &str) -> String {
        if self.overlap_size == 0 {
            return String::new();
        }
        let tail = tail_chars(text, self.overlap_size);
        let tail_len = char_len(tail);

        let mut last_terminator: Option<(usize, usize)> = None;
        for (pos, (byte_idx, ch)) in tail.char_indices().enumerate() {
            if matches!(ch, '.' | '!' | '?') {
                last_terminator = Some((pos, byte_idx + ch.len_utf8()));
            }
        }

        if let Some((pos, byte_end)) = last_terminator {
            if pos > tail_len / 2 {
                return tail[byte_end..].trim_start().to_string();
            }
        }

        tail.to_string()
    }

    fn emit(
        &self,
        out: &mut Vec<Chunk>,
        next_id: &mut usize,
        content: &str,
        page_number: usize,
        char_start: usize,
    ) {
        let len = char_len(content);
        if len < self.min_chunk_chars {
            return;
        }
        out.push(Chunk {
            id: format!("chunk_{}", *next_id),
            content: content.to_string(),
            page_number,
            char_start,
            char_end: char_start + len,
        });
        *next_id += 1;
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn byte_index_at_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    &s[byte_index_at_char(s, start)..byte_index_at_char(s, end)]
}

fn tail_chars(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if len <= n {
        return s;
    }
    &s[byte_index_at_char(s, len - n)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: usize, text: &str) -> Page {
        Page {
            number,
            text: text.to_string(),
            char_count: text.chars().count(),
        }
    }

    #[test]
    fn parrafo_gigante_se_trocea_en_rebanadas() {
        let chunker = Chunker::new(4000, 120, 50);
        let texto = "a".repeat(9000);
        let chunks = chunker.chunk(&[page(1, &texto)]);

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 4000));
        let total: usize = chunks.iter().map(|c| c.content.chars().count()).sum();
        assert_eq!(total, 9000);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks.last().unwrap().char_end, 9000);
    }

    #[test]
    fn ningun_chunk_supera_el_maximo() {
        let chunker = Chunker::new(100, 30, 10);
        let parrafos: Vec<String> = (0..12)
            .map(|i| format!("Párrafo número {i} con un texto de relleno variado."))
            .collect();
        let texto = parrafos.join("\n\n");
        let chunks = chunker.chunk(&[page(1, &texto)]);

        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 100));
    }

    #[test]
    fn el_troceado_es_idempotente() {
        let chunker = Chunker::new(80, 20, 10);
        let texto = "Primera frase del documento.\n\nSegunda parte con más texto.\n\nTercera parte que cierra el párrafo largo.";
        let pages = [page(1, texto)];
        let a = chunker.chunk(&pages);
        let b = chunker.chunk(&pages);
        assert_eq!(a, b);
    }

    #[test]
    fn el_solape_respeta_el_limite_configurado() {
        let chunker = Chunker::new(100, 30, 10);
        let parrafos: Vec<String> = (0..8)
            .map(|i| format!("Bloque {i} con contenido suficiente para acumular."))
            .collect();
        let texto = parrafos.join("\n\n");
        let chunks = chunker.chunk(&[page(1, &texto)]);

        for pair in chunks.windows(2) {
            let solape = pair[0].char_end.saturating_sub(pair[1].char_start);
            assert!(solape <= 30, "solape {solape} excede el límite");
        }
    }

    #[test]
    fn la_semilla_corta_en_fin_de_frase() {
        let chunker = Chunker::new(100, 20, 1);
        let texto = format!("{}. Cola", "x".repeat(50));
        assert_eq!(chunker.overlap_tail(&texto), "Cola");
    }

    #[test]
    fn la_semilla_es_literal_sin_fin_de_frase() {
        let chunker = Chunker::new(100, 20, 1);
        let texto = "y".repeat(60);
        assert_eq!(chunker.overlap_tail(&texto), "y".repeat(20));
    }

    #[test]
    fn la_semilla_se_descarta_si_rompe_el_maximo() {
        let chunker = Chunker::new(100, 80, 10);
        let p1 = "a".repeat(90);
        let p2 = "b".repeat(60);
        let texto = format!("{p1}\n\n{p2}");
        let chunks = chunker.chunk(&[page(1, &texto)]);

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 100));
        // El segundo chunk arranca limpio en el offset real del segundo párrafo.
        assert_eq!(chunks[1].char_start, 92);
        assert_eq!(chunks[1].content, p2);
    }

    #[test]
    fn descarta_chunks_por_debajo_del_minimo() {
        let chunker = Chunker::new(100, 20, 50);
        let chunks = chunker.chunk(&[page(1, "texto corto")]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn conserva_la_pagina_de_origen() {
        let chunker = Chunker::new(200, 20, 10);
        let pages = [
            page(1, "Contenido razonable de la primera página."),
            page(3, "Contenido razonable de la tercera página."),
        ];
        let chunks = chunker.chunk(&pages);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, 1);
        assert_eq!(chunks[1].page_number, 3);
        assert_eq!(chunks[0].id, "chunk_0");
        assert_eq!(chunks[1].id, "chunk_1");
    }
}
