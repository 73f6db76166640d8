//! Cache key templates.
//!
//! Templates interpolate `{{ expr }}` placeholders:
//!
//! - `arch`, `platform`, `job`, `workflow`, `branch`, `revision`, `epoch`
//! - `env.NAME`
//! - `checksum "path"`: SHA-256 of a file inside the job sandbox
//!
//! Volatile placeholders (`checksum`, `revision`, `epoch`) mark the points
//! where a rendered key may be cut to form a fallback prefix.

use kiln_core::cache::SUFFIX_SEPARATOR;
use kiln_core::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid placeholder regex"));

static CHECKSUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^checksum\s+"([^"]+)"$"#).expect("valid checksum regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExpr {
    Arch,
    Platform,
    Job,
    Workflow,
    Branch,
    Revision,
    Epoch,
    Env(String),
    Checksum(String),
}

impl KeyExpr {
    fn parse(expr: &str) -> std::result::Result<Self, String> {
        let parsed = match expr {
            "arch" => KeyExpr::Arch,
            "platform" => KeyExpr::Platform,
            "job" => KeyExpr::Job,
            "workflow" => KeyExpr::Workflow,
            "branch" | ".Branch" => KeyExpr::Branch,
            "revision" | ".Revision" => KeyExpr::Revision,
            "epoch" => KeyExpr::Epoch,
            _ => {
                if let Some(name) = expr.strip_prefix("env.") {
                    if name.is_empty() {
                        return Err("empty environment variable name".to_string());
                    }
                    KeyExpr::Env(name.to_string())
                } else if let Some(caps) = CHECKSUM.captures(expr) {
                    KeyExpr::Checksum(caps[1].to_string())
                } else {
                    return Err(format!("unknown expression '{expr}'"));
                }
            }
        };
        Ok(parsed)
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, KeyExpr::Checksum(_) | KeyExpr::Revision | KeyExpr::Epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fragment {
    Literal(String),
    Expr(KeyExpr),
}

/// A parsed cache key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    fragments: Vec<Fragment>,
}

impl KeyTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let mut fragments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(source) {
            let whole = caps.get(0).expect("capture group 0 always present");
            if whole.start() > last {
                fragments.push(Fragment::Literal(source[last..whole.start()].to_string()));
            }
            let expr = KeyExpr::parse(&caps[1]).map_err(|message| Error::InvalidKeyTemplate {
                template: source.to_string(),
                message,
            })?;
            fragments.push(Fragment::Expr(expr));
            last = whole.end();
        }
        if last < source.len() {
            fragments.push(Fragment::Literal(source[last..].to_string()));
        }
        if fragments
            .iter()
            .any(|f| matches!(f, Fragment::Literal(text) if text.contains(SUFFIX_SEPARATOR)))
        {
            return Err(Error::InvalidKeyTemplate {
                template: source.to_string(),
                message: format!("'{SUFFIX_SEPARATOR}' is reserved for save suffixes"),
            });
        }
        if fragments.is_empty() {
            return Err(Error::InvalidKeyTemplate {
                template: source.to_string(),
                message: "empty template".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            fragments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the template against a job's context.
    pub fn render(&self, ctx: &KeyContext) -> Result<RenderedKey> {
        let mut key = String::new();
        let mut cut_points = Vec::new();
        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(text) => key.push_str(text),
                Fragment::Expr(expr) => {
                    if expr.is_volatile() {
                        cut_points.push(key.len());
                    }
                    key.push_str(&sanitize_key(&ctx.resolve(expr)?));
                }
            }
        }
        Ok(RenderedKey { key, cut_points })
    }
}

/// Values a key template can refer to.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub arch: String,
    pub platform: String,
    pub job: String,
    pub workflow: String,
    pub branch: String,
    pub revision: Option<String>,
    pub env: HashMap<String, String>,
    /// Directory `checksum` paths are resolved against.
    pub workdir: PathBuf,
    pub epoch: i64,
}

impl KeyContext {
    fn resolve(&self, expr: &KeyExpr) -> Result<String> {
        let value = match expr {
            KeyExpr::Arch => self.arch.clone(),
            KeyExpr::Platform => self.platform.clone(),
            KeyExpr::Job => self.job.clone(),
            KeyExpr::Workflow => self.workflow.clone(),
            KeyExpr::Branch => self.branch.clone(),
            KeyExpr::Revision => self.revision.clone().unwrap_or_default(),
            KeyExpr::Epoch => self.epoch.to_string(),
            KeyExpr::Env(name) => self.env.get(name).cloned().unwrap_or_default(),
            KeyExpr::Checksum(path) => checksum_file(&self.workdir.join(path))?,
        };
        Ok(value)
    }
}

fn checksum_file(path: &std::path::Path) -> Result<String> {
    let contents = std::fs::read(path)
        .map_err(|e| Error::Cache(format!("cannot checksum {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

/// A rendered key plus the offsets where volatile fragments begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedKey {
    pub key: String,
    pub cut_points: Vec<usize>,
}

impl RenderedKey {
    /// Fallback prefixes, longest first. Never empty strings, never the full key.
    pub fn fallback_prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self
            .cut_points
            .iter()
            .rev()
            .filter(|&&cut| cut > 0 && cut < self.key.len())
            .map(|&cut| &self.key[..cut])
            .collect();
        prefixes.dedup();
        prefixes
    }
}

/// Replace characters an interpolated value must not carry into a key.
///
/// Each replaced character is single-byte, so cut points stay valid.
pub fn sanitize_key(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            SUFFIX_SEPARATOR => '_',
            c if c.is_ascii_whitespace() || c.is_ascii_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(workdir: PathBuf) -> KeyContext {
        KeyContext {
            arch: "x86_64".to_string(),
            platform: "linux".to_string(),
            job: "fetch".to_string(),
            workflow: "test".to_string(),
            branch: "master".to_string(),
            revision: Some("abc123".to_string()),
            env: HashMap::from([("TOOLCHAIN".to_string(), "stable".to_string())]),
            workdir,
            epoch: 1_700_000_000,
        }
    }

    #[test]
    fn test_render_plain_fields() {
        let template = KeyTemplate::parse("v1-{{ arch }}-{{job}}-{{ env.TOOLCHAIN }}-{{ .Branch }}").unwrap();
        let rendered = template.render(&context(PathBuf::from("/tmp"))).unwrap();
        assert_eq!(rendered.key, "v1-x86_64-fetch-stable-master");
        assert!(rendered.cut_points.is_empty());
        assert!(rendered.fallback_prefixes().is_empty());
    }

    #[test]
    fn test_render_checksum_and_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), b"lockfile").unwrap();

        let template =
            KeyTemplate::parse(r#"v1-cargo-{{ arch }}-{{ checksum "Cargo.lock" }}-{{ epoch }}"#).unwrap();
        let rendered = template.render(&context(dir.path().to_path_buf())).unwrap();

        let digest = hex::encode(Sha256::digest(b"lockfile"));
        assert_eq!(rendered.key, format!("v1-cargo-x86_64-{digest}-1700000000"));
        assert_eq!(
            rendered.fallback_prefixes(),
            vec![format!("v1-cargo-x86_64-{digest}-").as_str(), "v1-cargo-x86_64-"]
        );
    }

    #[test]
    fn test_missing_checksum_file_is_cache_error() {
        let template = KeyTemplate::parse(r#"deps-{{ checksum "missing.lock" }}"#).unwrap();
        let err = template.render(&context(PathBuf::from("/nonexistent"))).unwrap_err();
        assert!(err.is_cache());
    }

    #[test]
    fn test_unknown_expression_rejected() {
        let err = KeyTemplate::parse("v1-{{ nonsense }}").unwrap_err();
        assert!(matches!(err, Error::InvalidKeyTemplate { .. }));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("release/1.0"), "release/1.0");
        assert_eq!(sanitize_key("cache key#1"), "cache_key_1");
    }

    #[test]
    fn test_separator_never_reaches_rendered_key() {
        let mut ctx = context(PathBuf::from("/tmp"));
        ctx.env.insert("TOOLCHAIN".to_string(), "nightly#2024".to_string());
        ctx.revision = Some("abc#def".to_string());

        let rendered = KeyTemplate::parse("v1-{{ env.TOOLCHAIN }}-{{ revision }}")
            .unwrap()
            .render(&ctx)
            .unwrap();

        assert_eq!(rendered.key, "v1-nightly_2024-abc_def");
        assert_eq!(rendered.fallback_prefixes(), vec!["v1-nightly_2024-"]);
    }

    #[test]
    fn test_separator_in_template_text_rejected() {
        let err = KeyTemplate::parse("v1#{{ arch }}").unwrap_err();
        assert!(matches!(err, Error::InvalidKeyTemplate { .. }));
    }
}
