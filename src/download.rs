//! Descarga del documento origen con reintentos acotados y tope de tamaño.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::PipelineError;

/// Tamaño mínimo en bytes para considerar plausible un PDF real.
const MIN_PLAUSIBLE_BYTES: usize = 1024;

/// Cliente de descarga de documentos. Reutilizable entre peticiones;
/// no guarda estado por petición.
pub struct DocumentFetcher {
    client: reqwest::Client,
    max_retries: u32,
    max_bytes: usize,
}

impl DocumentFetcher {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        // Algunos servidores de documentos rechazan clientes sin User-Agent.
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            ),
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/pdf,application/octet-stream,*/*"),
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.download_timeout_secs))
            .default_headers(headers)
            .build()
            .context("No se pudo construir el cliente HTTP de descarga")?;

        Ok(Self {
            client,
            max_retries: cfg.download_max_retries,
            max_bytes: cfg.download_max_bytes,
        })
    }

    /// Descarga el documento en `url`. Reintenta hasta `max_retries` veces con
    /// backoff exponencial; trunca al tope configurado en lugar de fallar.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            info!("Descargando documento (intento {attempt}/{})...", self.max_retries);

            match self.fetch_once(url).await {
                Ok(bytes) => {
                    info!(
                        "Documento descargado: {:.1} MB",
                        bytes.len() as f64 / (1024.0 * 1024.0)
                    );
                    return Ok(bytes);
                }
                Err(err) => {
                    warn!("Fallo de descarga en el intento {attempt}: {err:#}");
                    last_error = format!("{err:#}");
                }
            }

            if attempt < self.max_retries {
                let wait = Duration::from_secs(3u64.pow(attempt));
                info!("Reintentando en {} segundos...", wait.as_secs());
                tokio::time::sleep(wait).await;
            }
        }

        Err(PipelineError::Download(format!(
            "No se pudo descargar el documento tras {} intentos: {last_error}",
            self.max_retries
        )))
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .context("Fallo de red al solicitar el documento")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("El servidor respondió {status}");
        }

        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Fallo de red leyendo el cuerpo del documento")?
        {
            body.extend_from_slice(&chunk);
            if body.len() > self.max_bytes {
                warn!(
                    "Documento muy grande ({:.1} MB); se trunca a {:.1} MB para su procesado",
                    body.len() as f64 / (1024.0 * 1024.0),
                    self.max_bytes as f64 / (1024.0 * 1024.0)
                );
                body.truncate(self.max_bytes);
                truncated = true;
                break;
            }
        }

        if !truncated && body.len() < MIN_PLAUSIBLE_BYTES {
            anyhow::bail!(
                "El contenido descargado ({} bytes) es demasiado pequeño para ser un documento válido",
                body.len()
            );
        }

        Ok(body)
    }
}
