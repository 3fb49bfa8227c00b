//! Seam to the host's content-blocking engine.
//!
//! The engine compiles the network payload asynchronously and, once
//! compiled, attaches it to browsing contexts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifier under which the network payload is compiled.
pub const FILTER_IDENTIFIER: &str = "sift-content-filter";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Compilation failed: {0}")]
    Compile(String),
    #[error("No compiled filter to apply")]
    NotCompiled,
    #[error("Failed to apply filter to {target}: {reason}")]
    Apply { target: String, reason: String },
}

#[async_trait::async_trait]
pub trait ContentBlockingEngine: Send + Sync {
    async fn compile(&self, identifier: &str, payload: Vec<u8>) -> Result<(), EngineError>;

    /// Attach the last compiled filter to `target`.
    async fn apply_compiled(&self, target: &str) -> Result<(), EngineError>;

    fn is_compiled(&self) -> bool;
}

/// Engine that writes the payload to `<dir>/<identifier>.json` and applies it
/// by copying that file into `<dir>/applied/<target>.json`. Used to hand the
/// payload to tools outside the process.
pub struct FileExportEngine {
    dir: PathBuf,
    compiled: AtomicBool,
    identifier: std::sync::Mutex<Option<String>>,
}

impl FileExportEngine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            compiled: AtomicBool::new(false),
            identifier: std::sync::Mutex::new(None),
        }
    }

    pub fn payload_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.json"))
    }

    fn current_identifier(&self) -> Option<String> {
        match self.identifier.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl ContentBlockingEngine for FileExportEngine {
    async fn compile(&self, identifier: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        // The engine refuses payloads that are not a JSON array
        let parsed: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| EngineError::Compile(e.to_string()))?;
        if !parsed.is_array() {
            return Err(EngineError::Compile("payload is not a JSON array".to_string()));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::Compile(e.to_string()))?;
        let path = self.payload_path(identifier);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload)
            .await
            .map_err(|e| EngineError::Compile(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::Compile(e.to_string()))?;

        match self.identifier.lock() {
            Ok(mut guard) => *guard = Some(identifier.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(identifier.to_string()),
        }
        self.compiled.store(true, Ordering::Release);
        log::info!("Compiled content filter '{}' to {}", identifier, path.display());
        Ok(())
    }

    async fn apply_compiled(&self, target: &str) -> Result<(), EngineError> {
        let identifier = self.current_identifier().ok_or(EngineError::NotCompiled)?;
        let applied = self.dir.join("applied");
        let apply_err = |e: std::io::Error| EngineError::Apply {
            target: target.to_string(),
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(&applied).await.map_err(apply_err)?;
        tokio::fs::copy(self.payload_path(&identifier), applied.join(format!("{target}.json")))
            .await
            .map_err(apply_err)?;
        Ok(())
    }

    fn is_compiled(&self) -> bool {
        self.compiled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compile_then_apply() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileExportEngine::new(dir.path());
        assert!(!engine.is_compiled());
        assert!(matches!(
            engine.apply_compiled("main").await,
            Err(EngineError::NotCompiled)
        ));

        engine.compile(FILTER_IDENTIFIER, b"[]".to_vec()).await.unwrap();
        assert!(engine.is_compiled());
        engine.apply_compiled("main").await.unwrap();

        let applied = std::fs::read(dir.path().join("applied").join("main.json")).unwrap();
        assert_eq!(applied, b"[]");
    }

    #[tokio::test]
    async fn rejects_non_array_payload() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FileExportEngine::new(dir.path());
        let err = engine.compile(FILTER_IDENTIFIER, b"{}".to_vec()).await;
        assert!(matches!(err, Err(EngineError::Compile(_))));
        assert!(!engine.is_compiled());
    }
}
