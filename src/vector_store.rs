//! Índice vectorial de vida por-petición, con dos backends intercambiables:
//! uno exacto en memoria y otro remoto tipo Pinecone (API REST).
//!
//! La métrica es similitud coseno, implementada como producto interno sobre
//! vectores normalizados L2. La elección de backend se hace una sola vez en la
//! construcción del pipeline; si el backend remoto no responde o su dimensión
//! no encaja, se degrada al backend en memoria con un aviso.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, VectorBackend};
use crate::error::PipelineError;
use crate::models::ChunkMeta;

/// Norma mínima para considerar un vector no nulo.
const MIN_NORM: f64 = 1e-12;

/// Tamaño de lote para las subidas al backend remoto.
const UPSERT_BATCH: usize = 100;

// ---------------------------------------------------------------------------
// Backend exacto en memoria
// ---------------------------------------------------------------------------

/// Índice exacto en memoria. Los vectores se normalizan al insertarse;
/// la búsqueda es un barrido completo con producto interno.
pub struct MemoryIndex {
    dimension: usize,
    entries: Vec<(Vec<f64>, ChunkMeta)>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(
        &mut self,
        vectors: Vec<Vec<f64>>,
        metas: Vec<ChunkMeta>,
    ) -> Result<(), PipelineError> {
        if vectors.len() != metas.len() {
            return Err(PipelineError::Index(format!(
                "{} vectores para {} metadatos",
                vectors.len(),
                metas.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(PipelineError::Index(format!(
                    "Dimensión incompatible: se esperaba {}, llegó {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }
        for (vector, meta) in vectors.into_iter().zip(metas) {
            self.entries.push((l2_normalize(&vector), meta));
        }
        Ok(())
    }

    /// Devuelve los `top_k` más similares en orden descendente de puntuación;
    /// los empates se resuelven por orden de inserción. Un índice vacío
    /// devuelve una lista vacía, nunca un error.
    pub fn search(
        &self,
        query: &[f64],
        top_k: usize,
    ) -> Result<Vec<(ChunkMeta, f64)>, PipelineError> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(PipelineError::Index(format!(
                "Dimensión incompatible en la consulta: se esperaba {}, llegó {}",
                self.dimension,
                query.len()
            )));
        }

        let query = l2_normalize(query);
        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, (vector, _))| (idx, dot(&query, vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(idx, score)| (self.entries[idx].1.clone(), score))
            .collect())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Normalización L2. Un vector de norma nula se mapea al vector cero
/// (puntuación 0) en lugar de dividir por cero.
fn l2_normalize(vector: &[f64]) -> Vec<f64> {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm < MIN_NORM {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ---------------------------------------------------------------------------
// Backend remoto (Pinecone)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: &'a [RemoteVector],
    namespace: &'a str,
}

#[derive(Serialize)]
struct RemoteVector {
    id: String,
    values: Vec<f64>,
    metadata: ChunkMeta,
}

#[derive(Serialize)]
struct RemoteQueryRequest<'a> {
    namespace: &'a str,
    #[serde(rename = "topK")]
    top_k: usize,
    vector: &'a [f64],
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
}

#[derive(Deserialize)]
struct RemoteQueryResponse {
    #[serde(default)]
    matches: Vec<RemoteMatch>,
}

#[derive(Deserialize)]
struct RemoteMatch {
    score: f64,
    metadata: Option<ChunkMeta>,
}

#[derive(Serialize)]
struct RemoteDeleteRequest<'a> {
    #[serde(rename = "deleteAll")]
    delete_all: bool,
    namespace: &'a str,
}

#[derive(Deserialize)]
struct RemoteIndexStats {
    dimension: usize,
}

/// Cliente del índice remoto. Compartido entre peticiones; cada petición abre
/// su propia sesión con un namespace efímero.
#[derive(Clone)]
pub struct PineconeClient {
    http: reqwest::Client,
    host: String,
}

impl PineconeClient {
    pub fn new(api_key: &str, host: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(api_key.trim()).context("Clave de Pinecone inválida")?,
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .context("No se pudo construir el cliente HTTP de Pinecone")?;

        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
        })
    }

    /// Consulta la dimensión del índice remoto; sirve también de sonda de
    /// disponibilidad en el arranque.
    pub async fn probe_dimension(&self) -> Result<usize> {
        let url = format!("{}/describe_index_stats", self.host);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("No se pudo contactar con el índice remoto")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("El índice remoto respondió {status}");
        }

        let stats: RemoteIndexStats = response
            .json()
            .await
            .context("Respuesta inesperada del índice remoto")?;
        Ok(stats.dimension)
    }

    pub fn session(&self, dimension: usize) -> PineconeSession {
        PineconeSession {
            client: self.clone(),
            namespace: format!("req-{}", Uuid::new_v4()),
            dimension,
        }
    }
}

/// Sesión por petición sobre el índice remoto: namespace efímero que se
/// puebla, se consulta y se borra antes de devolver la respuesta.
pub struct PineconeSession {
    client: PineconeClient,
    namespace: String,
    dimension: usize,
}

impl PineconeSession {
    pub async fn add(
        &mut self,
        vectors: Vec<Vec<f64>>,
        metas: Vec<ChunkMeta>,
    ) -> Result<(), PipelineError> {
        if vectors.len() != metas.len() {
            return Err(PipelineError::Index(format!(
                "{} vectores para {} metadatos",
                vectors.len(),
                metas.len()
            )));
        }

        let mut payload = Vec::with_capacity(vectors.len());
        for (vector, meta) in vectors.into_iter().zip(metas) {
            if vector.len() != self.dimension {
                return Err(PipelineError::Index(format!(
                    "Dimensión incompatible: se esperaba {}, llegó {}",
                    self.dimension,
                    vector.len()
                )));
            }
            payload.push(RemoteVector {
                id: meta.chunk_id.clone(),
                values: l2_normalize(&vector),
                metadata: meta,
            });
        }

        for batch in payload.chunks(UPSERT_BATCH) {
            let body = UpsertRequest {
                vectors: batch,
                namespace: &self.namespace,
            };
            let url = format!("{}/vectors/upsert", self.client.host);
            let response = self
                .client
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| PipelineError::Index(format!("Fallo subiendo vectores: {e}")))?;
            if !response.status().is_success() {
                return Err(PipelineError::Index(format!(
                    "El índice remoto rechazó la subida: {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    pub async fn search(
        &self,
        query: &[f64],
        top_k: usize,
    ) -> Result<Vec<(ChunkMeta, f64)>, PipelineError> {
        if query.len() != self.dimension {
            return Err(PipelineError::Index(format!(
                "Dimensión incompatible en la consulta: se esperaba {}, llegó {}",
                self.dimension,
                query.len()
            )));
        }

        let normalized = l2_normalize(query);
        let body = RemoteQueryRequest {
            namespace: &self.namespace,
            top_k,
            vector: &normalized,
            include_metadata: true,
        };
        let url = format!("{}/query", self.client.host);
        let response = self
            .client
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Index(format!("Fallo consultando el índice: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::Index(format!(
                "El índice remoto rechazó la consulta: {}",
                response.status()
            )));
        }

        let parsed: RemoteQueryResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Index(format!("Respuesta inesperada del índice: {e}")))?;

        Ok(parsed
            .matches
            .into_iter()
            .filter_map(|m| m.metadata.map(|meta| (meta, m.score)))
            .collect())
    }

    pub async fn clear(&mut self) -> Result<(), PipelineError> {
        let body = RemoteDeleteRequest {
            delete_all: true,
            namespace: &self.namespace,
        };
        let url = format!("{}/vectors/delete", self.client.host);
        let response = self
            .client
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Index(format!("Fallo vaciando el namespace: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::Index(format!(
                "El índice remoto no pudo vaciar el namespace: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selección de backend y sesión por petición
// ---------------------------------------------------------------------------

/// Backend elegido en el arranque. La decisión de degradar a memoria se toma
/// aquí una sola vez, no en cada petición.
pub enum IndexBackend {
    Memory,
    Pinecone(PineconeClient),
}

impl IndexBackend {
    pub async fn from_config(cfg: &AppConfig, dimension: usize) -> Self {
        match cfg.vector_backend {
            VectorBackend::Memory => Self::Memory,
            VectorBackend::Pinecone => {
                let api_key = cfg.pinecone_api_key.as_deref().unwrap_or_default();
                let host = cfg.pinecone_index_host.as_deref().unwrap_or_default();

                let client = match PineconeClient::new(api_key, host) {
                    Ok(client) => client,
                    Err(err) => {
                        warn!("Pinecone mal configurado ({err:#}); se usa el índice en memoria");
                        return Self::Memory;
                    }
                };

                match client.probe_dimension().await {
                    Ok(remote_dim) if remote_dim == dimension => {
                        info!("Backend vectorial remoto disponible (dimensión {remote_dim})");
                        Self::Pinecone(client)
                    }
                    Ok(remote_dim) => {
                        warn!(
                            "Dimensión del índice remoto ({remote_dim}) distinta a la del \
                             modelo de embeddings ({dimension}); se usa el índice en memoria"
                        );
                        Self::Memory
                    }
                    Err(err) => {
                        warn!("Índice remoto no disponible ({err:#}); se usa el índice en memoria");
                        Self::Memory
                    }
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Pinecone(_) => "pinecone",
        }
    }

    /// Abre una sesión de índice para una petición. El índice en memoria es
    /// una instancia nueva; el remoto, un namespace efímero.
    pub fn session(&self, dimension: usize) -> IndexSession {
        match self {
            Self::Memory => IndexSession::Memory(MemoryIndex::new(dimension)),
            Self::Pinecone(client) => IndexSession::Pinecone(client.session(dimension)),
        }
    }
}

/// Sesión de índice de una petición concreta, con el mismo contrato sobre
/// ambos backends.
pub enum IndexSession {
    Memory(MemoryIndex),
    Pinecone(PineconeSession),
}

impl IndexSession {
    pub async fn add(
        &mut self,
        vectors: Vec<Vec<f64>>,
        metas: Vec<ChunkMeta>,
    ) -> Result<(), PipelineError> {
        match self {
            Self::Memory(index) => {
                index.add(vectors, metas)?;
                tracing::debug!("Índice en memoria poblado con {} vectores", index.len());
                Ok(())
            }
            Self::Pinecone(session) => session.add(vectors, metas).await,
        }
    }

    pub async fn search(
        &self,
        query: &[f64],
        top_k: usize,
    ) -> Result<Vec<(ChunkMeta, f64)>, PipelineError> {
        match self {
            Self::Memory(index) => index.search(query, top_k),
            Self::Pinecone(session) => session.search(query, top_k).await,
        }
    }

    pub async fn clear(&mut self) -> Result<(), PipelineError> {
        match self {
            Self::Memory(index) => {
                index.clear();
                Ok(())
            }
            Self::Pinecone(session) => session.clear().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, page: usize) -> ChunkMeta {
        ChunkMeta {
            chunk_id: id.to_string(),
            content: format!("contenido de {id}"),
            page_number: page,
            char_start: 0,
            char_end: 10,
        }
    }

    #[test]
    fn buscar_en_indice_vacio_devuelve_lista_vacia() {
        let index = MemoryIndex::new(3);
        let results = index.search(&[1.0, 0.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn el_vector_identico_queda_primero_con_puntuacion_maxima() {
        let mut index = MemoryIndex::new(3);
        index
            .add(
                vec![
                    vec![1.0, 0.0, 0.0],
                    vec![0.0, 1.0, 0.0],
                    vec![0.7, 0.7, 0.0],
                ],
                vec![meta("a", 1), meta("b", 2), meta("c", 3)],
            )
            .unwrap();

        let results = index.search(&[0.0, 1.0, 0.0], 3).unwrap();
        assert_eq!(results[0].0.chunk_id, "b");
        assert!((results[0].1 - 1.0).abs() < 1e-9);
        assert!(results
            .windows(2)
            .all(|pair| pair[0].1 >= pair[1].1));
    }

    #[test]
    fn los_empates_se_resuelven_por_orden_de_insercion() {
        let mut index = MemoryIndex::new(2);
        index
            .add(
                vec![vec![3.0, 0.0], vec![1.0, 0.0]],
                vec![meta("primero", 1), meta("segundo", 2)],
            )
            .unwrap();

        // Normalizados, ambos son idénticos: el orden de inserción decide.
        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0.chunk_id, "primero");
        assert_eq!(results[1].0.chunk_id, "segundo");
    }

    #[test]
    fn un_vector_nulo_no_produce_nan() {
        let mut index = MemoryIndex::new(2);
        index
            .add(vec![vec![0.0, 0.0]], vec![meta("nulo", 1)])
            .unwrap();

        let results = index.search(&[0.0, 0.0], 1).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 0.0);
    }

    #[test]
    fn la_dimension_incompatible_es_un_error() {
        let mut index = MemoryIndex::new(3);
        index
            .add(vec![vec![1.0, 0.0, 0.0]], vec![meta("bueno", 1)])
            .unwrap();

        let err = index
            .add(vec![vec![1.0, 2.0]], vec![meta("corto", 1)])
            .unwrap_err();
        assert_eq!(err.category(), "index_error");

        let err = index.search(&[1.0, 2.0], 1).unwrap_err();
        assert_eq!(err.category(), "index_error");
    }

    #[test]
    fn clear_deja_el_indice_vacio() {
        let mut index = MemoryIndex::new(2);
        index
            .add(vec![vec![1.0, 0.0]], vec![meta("x", 1)])
            .unwrap();
        assert_eq!(index.len(), 1);
        index.clear();
        assert_eq!(index.len(), 0);
        assert!(index.search(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn respeta_top_k() {
        let mut index = MemoryIndex::new(2);
        index
            .add(
                vec![vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0]],
                vec![meta("a", 1), meta("b", 2), meta("c", 3)],
            )
            .unwrap();
        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.chunk_id, "a");
    }
}
