//! Cache-key resolution with exact and prefix fallback.

use crate::archiver::{self, Compression};
use crate::keys::{KeyContext, KeyTemplate, RenderedKey};
use chrono::Utc;
use kiln_core::cache::{CacheEntry, CacheHit, RestoreOutcome};
use kiln_core::ports::CacheStore;
use kiln_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Renders key templates and talks to the cache store on behalf of a job.
#[derive(Clone)]
pub struct CacheKeyResolver {
    store: Arc<dyn CacheStore>,
    compression: Compression,
}

/// Suffix making every save of a key distinct: `<millis>-<8 hex>`.
pub fn unique_suffix() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &random[..8])
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Internal(format!("archive task failed: {e}"))
}

impl CacheKeyResolver {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            compression: Compression::default(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Look up one rendered key: the exact key first, then each fallback
    /// prefix from longest to shortest.
    pub async fn lookup(&self, rendered: &RenderedKey) -> Result<Option<CacheHit>> {
        if let Some(hit) = self.store.get(&rendered.key).await? {
            return Ok(Some(hit));
        }
        for prefix in rendered.fallback_prefixes() {
            if let Some(hit) = self.store.get_prefix(prefix).await? {
                debug!(prefix, matched = %hit.entry.key, "Cache prefix match");
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Render `template` and resolve it against the store.
    pub async fn restore_key(
        &self,
        template: &KeyTemplate,
        ctx: &KeyContext,
    ) -> Result<(RenderedKey, Option<CacheHit>)> {
        let rendered = template.render(ctx)?;
        let hit = self.lookup(&rendered).await?;
        Ok((rendered, hit))
    }

    /// Try each template in order; the first hit wins.
    pub async fn restore(
        &self,
        templates: &[String],
        ctx: &KeyContext,
    ) -> Result<(RestoreOutcome, Option<CacheHit>)> {
        let mut requested = Vec::with_capacity(templates.len());
        for source in templates {
            let template = KeyTemplate::parse(source)?;
            let (rendered, hit) = self.restore_key(&template, ctx).await?;
            if let Some(hit) = hit {
                let outcome = RestoreOutcome::Hit {
                    requested: rendered.key,
                    matched: hit.entry.key.clone(),
                    exact: hit.exact,
                    size_bytes: hit.entry.size_bytes,
                };
                return Ok((outcome, Some(hit)));
            }
            requested.push(rendered.key);
        }
        Ok((RestoreOutcome::Miss { requested }, None))
    }

    /// Render `template` and store `payload` under it with a fresh suffix.
    pub async fn save_key(
        &self,
        template: &KeyTemplate,
        ctx: &KeyContext,
        payload: Vec<u8>,
    ) -> Result<CacheEntry> {
        let rendered = template.render(ctx)?;
        self.store.put(&rendered.key, &unique_suffix(), payload).await
    }

    /// Restore the first matching template into `dest`.
    pub async fn restore_into(
        &self,
        templates: &[String],
        ctx: &KeyContext,
        dest: &Path,
    ) -> Result<RestoreOutcome> {
        let (outcome, hit) = self.restore(templates, ctx).await?;
        if let Some(hit) = hit {
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || archiver::unpack_from_slice(&hit.payload, &dest))
                .await
                .map_err(join_error)?
                .map_err(|e| Error::Cache(format!("failed to extract cache payload: {e}")))?;
        }
        match &outcome {
            RestoreOutcome::Hit {
                requested,
                matched,
                exact,
                size_bytes,
            } => info!(requested = %requested, matched = %matched, exact, size_bytes, "Cache restored"),
            RestoreOutcome::Miss { requested } => info!(keys = ?requested, "Cache miss"),
        }
        Ok(outcome)
    }

    /// Archive `paths` under `base_dir` and save them under `template`.
    ///
    /// Returns `None` when none of the paths exist.
    pub async fn save_from(
        &self,
        template: &str,
        ctx: &KeyContext,
        paths: &[String],
        base_dir: &Path,
    ) -> Result<Option<CacheEntry>> {
        let template = KeyTemplate::parse(template)?;
        let compression = self.compression;
        let paths_owned = paths.to_vec();
        let base: PathBuf = base_dir.to_path_buf();
        let (packed, payload) = tokio::task::spawn_blocking(move || {
            let mut buffer = Vec::new();
            let packed = archiver::create_archive(&mut buffer, &paths_owned, &base, compression)?;
            Ok::<_, Error>((packed, buffer))
        })
        .await
        .map_err(join_error)??;

        if packed == 0 {
            info!(template = %template.source(), paths = ?paths, "No cache paths found, skipping save");
            return Ok(None);
        }
        let entry = self.save_key(&template, ctx, payload).await?;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;
    use std::collections::HashMap;

    fn context(workdir: &Path) -> KeyContext {
        KeyContext {
            arch: "x86_64".to_string(),
            platform: "linux".to_string(),
            job: "fetch".to_string(),
            workflow: "test".to_string(),
            branch: "master".to_string(),
            revision: None,
            env: HashMap::new(),
            workdir: workdir.to_path_buf(),
            epoch: 0,
        }
    }

    const TEMPLATE: &str = r#"v1-cargo-{{ arch }}-{{ checksum "Cargo.lock" }}"#;

    #[tokio::test]
    async fn test_exact_hit_after_save() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), b"v1").unwrap();
        let resolver = CacheKeyResolver::new(Arc::new(MemoryCacheStore::default()));
        let ctx = context(dir.path());
        let template = KeyTemplate::parse(TEMPLATE).unwrap();

        resolver.save_key(&template, &ctx, b"deps".to_vec()).await.unwrap();
        let (rendered, hit) = resolver.restore_key(&template, &ctx).await.unwrap();
        let hit = hit.unwrap();
        assert!(hit.exact);
        assert_eq!(hit.entry.key, rendered.key);
        assert_eq!(hit.payload, b"deps");
    }

    #[tokio::test]
    async fn test_lockfile_change_falls_back_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CacheKeyResolver::new(Arc::new(MemoryCacheStore::default()));
        let ctx = context(dir.path());
        let template = KeyTemplate::parse(TEMPLATE).unwrap();

        std::fs::write(dir.path().join("Cargo.lock"), b"old").unwrap();
        resolver.save_key(&template, &ctx, b"old-deps".to_vec()).await.unwrap();

        std::fs::write(dir.path().join("Cargo.lock"), b"new").unwrap();
        let (rendered, hit) = resolver.restore_key(&template, &ctx).await.unwrap();
        let hit = hit.unwrap();
        assert!(!hit.exact);
        assert_ne!(hit.entry.key, rendered.key);
        assert_eq!(hit.payload, b"old-deps");
    }

    #[tokio::test]
    async fn test_other_arch_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), b"v1").unwrap();
        let resolver = CacheKeyResolver::new(Arc::new(MemoryCacheStore::default()));
        let template = KeyTemplate::parse(TEMPLATE).unwrap();

        let mut arm = context(dir.path());
        arm.arch = "aarch64".to_string();
        resolver.save_key(&template, &arm, b"arm".to_vec()).await.unwrap();

        let (outcome, hit) = resolver
            .restore(&[TEMPLATE.to_string()], &context(dir.path()))
            .await
            .unwrap();
        assert!(hit.is_none());
        assert!(!outcome.is_hit());
    }

    #[tokio::test]
    async fn test_save_from_and_restore_into() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("Cargo.lock"), b"v1").unwrap();
        std::fs::write(dst.path().join("Cargo.lock"), b"v1").unwrap();
        std::fs::create_dir_all(src.path().join(".cargo/registry")).unwrap();
        std::fs::write(src.path().join(".cargo/registry/index"), b"crates").unwrap();

        let resolver = CacheKeyResolver::new(Arc::new(MemoryCacheStore::default()));
        let saved = resolver
            .save_from(TEMPLATE, &context(src.path()), &[".cargo".to_string()], src.path())
            .await
            .unwrap();
        assert!(saved.is_some());

        let outcome = resolver
            .restore_into(&[TEMPLATE.to_string()], &context(dst.path()), dst.path())
            .await
            .unwrap();
        assert!(outcome.is_hit());
        assert_eq!(
            std::fs::read(dst.path().join(".cargo/registry/index")).unwrap(),
            b"crates"
        );
    }

    #[tokio::test]
    async fn test_save_from_without_paths_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CacheKeyResolver::new(Arc::new(MemoryCacheStore::default()));
        let saved = resolver
            .save_from("v1-{{ job }}", &context(dir.path()), &["target".to_string()], dir.path())
            .await
            .unwrap();
        assert!(saved.is_none());
        assert!(resolver.store().list(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_unique_suffix_shape() {
        let suffix = unique_suffix();
        let (millis, random) = suffix.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 8);
    }
}
