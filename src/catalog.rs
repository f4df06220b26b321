//! Technology catalog: which backend engines exist and what they can do.
//!
//! The catalog is read-mostly. It is loaded once at startup from a
//! [`CatalogSource`] and optionally re-fetched when an operation session
//! starts; it is never mutated in place. Everything that needs to know
//! whether a technology can fulfil an operation family asks the catalog,
//! so a stale priority list can never smuggle an incapable engine into an
//! attempt plan.
//!
//! ## Built-in engines
//!
//! | Id | Kind | Rating | Role |
//! |----|------|--------|------|
//! | `adobe`       | cloud | 5 | Full PDF services suite |
//! | `ai_cloud`    | cloud | 4 | AI-assisted OCR, summaries, generation |
//! | `libreoffice` | local | 3 | Office format rendering |
//! | `tesseract`   | local | 3 | Local OCR |
//! | `pdf_lib`     | local | 2 | Pure-library fallback for PDF editing |

use crate::error::DocOpsError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

// lowercase snake_case, e.g. "pdf_to_word"
static FAMILY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap());

// ── Identifiers ──────────────────────────────────────────────────────────

/// Name of a class of work several technologies may fulfil
/// (e.g. `compress`, `watermark`, `pdf_info`, `merge`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationFamily(String);

impl OperationFamily {
    /// Parse a family identifier. Only the syntax is checked here; use
    /// [`TechnologyCatalog::family_spec`] to check it is declared.
    pub fn new(name: impl Into<String>) -> Result<Self, DocOpsError> {
        let name = name.into();
        if FAMILY_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(DocOpsError::UnknownFamily(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationFamily {
    type Error = DocOpsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationFamily> for String {
    fn from(value: OperationFamily) -> Self {
        value.0
    }
}

impl fmt::Display for OperationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a backend engine, e.g. `adobe` or `pdf_lib`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TechnologyId(String);

impl TechnologyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TechnologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Descriptors ──────────────────────────────────────────────────────────

/// Where a technology runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnologyKind {
    Cloud,
    Local,
}

/// What a session does when an attempt against this technology fails.
///
/// Declared per family capability, never inferred: retrying a paid signing
/// operation against a second paid provider without consent is not an
/// acceptable guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Try the next technology in the resolved order. (default)
    #[default]
    FallThrough,
    /// Surface the failure; never try another technology.
    HardStop,
}

/// One family a technology can fulfil, with its fallback declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyCapability {
    pub family: OperationFamily,
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

/// Capability metadata of one backend engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyDescriptor {
    pub id: TechnologyId,
    #[serde(default)]
    pub label: String,
    pub kind: TechnologyKind,
    /// Qualitative rating, 1 (worst) to 5 (best).
    pub quality_rating: u8,
    pub capabilities: Vec<FamilyCapability>,
}

impl TechnologyDescriptor {
    pub fn capability(&self, family: &OperationFamily) -> Option<&FamilyCapability> {
        self.capabilities.iter().find(|c| &c.family == family)
    }

    pub fn supports(&self, family: &OperationFamily) -> bool {
        self.capability(family).is_some()
    }

    /// Fallback declaration for `family`; an incapable technology never
    /// falls through.
    pub fn fallback_policy(&self, family: &OperationFamily) -> FallbackPolicy {
        self.capability(family)
            .map(|c| c.fallback)
            .unwrap_or(FallbackPolicy::HardStop)
    }
}

/// Input arity of an operation family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySpec {
    pub family: OperationFamily,
    #[serde(default)]
    pub label: String,
    pub min_inputs: usize,
    /// `None` means unbounded.
    #[serde(default)]
    pub max_inputs: Option<usize>,
    /// Inputs come from a user-ordered file set (merge, batch-with-order).
    #[serde(default)]
    pub ordered_inputs: bool,
}

// ── Catalog ──────────────────────────────────────────────────────────────

/// Static registry of families and technologies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyCatalog {
    families: Vec<FamilySpec>,
    technologies: Vec<TechnologyDescriptor>,
}

impl TechnologyCatalog {
    /// Build a catalog, validating that ids are unique, every capability
    /// names a declared family, ratings are in 1–5 and every declared
    /// family has at least one capable technology.
    pub fn new(
        families: Vec<FamilySpec>,
        technologies: Vec<TechnologyDescriptor>,
    ) -> Result<Self, DocOpsError> {
        let invalid = |detail: String| DocOpsError::CatalogLoad {
            source_name: "catalog".into(),
            detail,
        };

        let mut family_names = HashSet::new();
        for spec in &families {
            if !family_names.insert(&spec.family) {
                return Err(invalid(format!("duplicate family '{}'", spec.family)));
            }
            if let Some(max) = spec.max_inputs {
                if max < spec.min_inputs {
                    return Err(invalid(format!(
                        "family '{}' has max_inputs {} < min_inputs {}",
                        spec.family, max, spec.min_inputs
                    )));
                }
            }
        }

        let mut tech_ids = HashSet::new();
        for tech in &technologies {
            if !tech_ids.insert(&tech.id) {
                return Err(invalid(format!("duplicate technology '{}'", tech.id)));
            }
            if !(1..=5).contains(&tech.quality_rating) {
                return Err(invalid(format!(
                    "technology '{}' has rating {} (expected 1–5)",
                    tech.id, tech.quality_rating
                )));
            }
            let mut seen = HashSet::new();
            for cap in &tech.capabilities {
                if !family_names.contains(&cap.family) {
                    return Err(invalid(format!(
                        "technology '{}' references undeclared family '{}'",
                        tech.id, cap.family
                    )));
                }
                if !seen.insert(&cap.family) {
                    return Err(invalid(format!(
                        "technology '{}' lists family '{}' twice",
                        tech.id, cap.family
                    )));
                }
            }
        }

        for spec in &families {
            if !technologies.iter().any(|t| t.supports(&spec.family)) {
                return Err(invalid(format!(
                    "family '{}' has no capable technology",
                    spec.family
                )));
            }
        }

        Ok(Self {
            families,
            technologies,
        })
    }

    /// Parse a catalog from its JSON representation.
    pub fn from_json_str(json: &str, source_name: &str) -> Result<Self, DocOpsError> {
        let raw: TechnologyCatalog =
            serde_json::from_str(json).map_err(|e| DocOpsError::CatalogLoad {
                source_name: source_name.to_string(),
                detail: e.to_string(),
            })?;
        Self::new(raw.families, raw.technologies).map_err(|e| match e {
            DocOpsError::CatalogLoad { detail, .. } => DocOpsError::CatalogLoad {
                source_name: source_name.to_string(),
                detail,
            },
            other => other,
        })
    }

    pub fn families(&self) -> &[FamilySpec] {
        &self.families
    }

    pub fn technologies(&self) -> &[TechnologyDescriptor] {
        &self.technologies
    }

    pub fn family_spec(&self, family: &OperationFamily) -> Option<&FamilySpec> {
        self.families.iter().find(|f| &f.family == family)
    }

    /// Resolve a user-supplied name to a declared family.
    pub fn parse_family(&self, name: &str) -> Result<OperationFamily, DocOpsError> {
        let family = OperationFamily::new(name)?;
        if self.family_spec(&family).is_some() {
            Ok(family)
        } else {
            Err(DocOpsError::UnknownFamily(name.to_string()))
        }
    }

    pub fn technology(&self, id: &TechnologyId) -> Option<&TechnologyDescriptor> {
        self.technologies.iter().find(|t| &t.id == id)
    }

    /// `true` when at least one technology advertises `family`.
    pub fn supports(&self, family: &OperationFamily) -> bool {
        self.technologies.iter().any(|t| t.supports(family))
    }

    /// Technologies advertising `family`, in catalog order.
    pub fn capable<'a>(
        &'a self,
        family: &'a OperationFamily,
    ) -> impl Iterator<Item = &'a TechnologyDescriptor> + 'a {
        self.technologies.iter().filter(move |t| t.supports(family))
    }

    /// The declared default ordering for `family`: cloud before local,
    /// then higher rating first, then id.
    pub fn default_order(&self, family: &OperationFamily) -> Vec<TechnologyId> {
        let mut capable: Vec<&TechnologyDescriptor> = self.capable(family).collect();
        capable.sort_by(|a, b| {
            kind_rank(a.kind)
                .cmp(&kind_rank(b.kind))
                .then(b.quality_rating.cmp(&a.quality_rating))
                .then(a.id.cmp(&b.id))
        });
        capable.into_iter().map(|t| t.id.clone()).collect()
    }

    /// The catalog shipped with the console.
    pub fn builtin() -> Self {
        builtin::catalog()
    }
}

fn kind_rank(kind: TechnologyKind) -> u8 {
    match kind {
        TechnologyKind::Cloud => 0,
        TechnologyKind::Local => 1,
    }
}

mod builtin {
    use super::*;

    // (family, label, min, max, ordered)
    const FAMILIES: &[(&str, &str, usize, Option<usize>, bool)] = &[
        ("compress", "Compress PDF", 1, Some(1), false),
        ("watermark", "Add watermark", 1, Some(1), false),
        ("pdf_info", "Inspect PDF", 1, Some(1), false),
        ("merge", "Merge PDFs", 2, None, true),
        ("split", "Split PDF", 1, Some(1), false),
        ("rotate", "Rotate pages", 1, Some(1), false),
        ("protect", "Password-protect PDF", 1, Some(1), false),
        ("unlock", "Remove PDF password", 1, Some(1), false),
        ("ocr", "OCR scanned PDF", 1, Some(1), false),
        ("pdf_to_word", "PDF to Word", 1, Some(1), false),
        ("pdf_to_excel", "PDF to Excel", 1, Some(1), false),
        ("pdf_to_ppt", "PDF to PowerPoint", 1, Some(1), false),
        ("pdf_to_image", "PDF to images", 1, Some(1), false),
        ("word_to_pdf", "Word to PDF", 1, Some(1), false),
        ("excel_to_pdf", "Excel to PDF", 1, Some(1), false),
        ("ppt_to_pdf", "PowerPoint to PDF", 1, Some(1), false),
        ("image_to_pdf", "Images to PDF", 1, None, true),
        ("html_to_pdf", "HTML to PDF", 1, Some(1), false),
        ("sign", "Signed seal", 1, Some(1), false),
        ("redact", "Redact PDF", 1, Some(1), false),
        ("page_numbers", "Add page numbers", 1, Some(1), false),
        ("extract_text", "Extract text", 1, Some(1), false),
        ("extract_images", "Extract images", 1, Some(1), false),
        ("flatten", "Flatten forms", 1, Some(1), false),
        ("repair", "Repair PDF", 1, Some(1), false),
        ("compare", "Compare two PDFs", 2, Some(2), true),
        ("batch_convert", "Batch convert", 1, None, true),
        ("summarize", "AI summary", 1, Some(1), false),
        ("translate", "AI translation", 1, Some(1), false),
        ("generate_document", "AI document generation", 0, Some(0), false),
        ("chat_with_pdf", "Chat with PDF", 1, Some(1), false),
    ];

    // (id, label, kind, rating, families, hard-stop families)
    type TechRow = (
        &'static str,
        &'static str,
        TechnologyKind,
        u8,
        &'static [&'static str],
        &'static [&'static str],
    );

    const TECHNOLOGIES: &[TechRow] = &[
        (
            "adobe",
            "Adobe PDF Services",
            TechnologyKind::Cloud,
            5,
            &[
                "compress", "watermark", "pdf_info", "merge", "split", "rotate", "protect",
                "unlock", "ocr", "pdf_to_word", "pdf_to_excel", "pdf_to_ppt", "pdf_to_image",
                "word_to_pdf", "excel_to_pdf", "ppt_to_pdf", "image_to_pdf", "html_to_pdf",
                "sign", "redact", "page_numbers", "extract_text", "extract_images", "flatten",
                "batch_convert",
            ],
            &["sign"],
        ),
        (
            "ai_cloud",
            "Cloud AI service",
            TechnologyKind::Cloud,
            4,
            &[
                "ocr", "pdf_to_word", "extract_text", "compare", "summarize", "translate",
                "generate_document", "chat_with_pdf",
            ],
            &[],
        ),
        (
            "libreoffice",
            "LibreOffice (headless)",
            TechnologyKind::Local,
            3,
            &[
                "pdf_to_word", "pdf_to_image", "word_to_pdf", "excel_to_pdf", "ppt_to_pdf",
                "html_to_pdf", "batch_convert",
            ],
            &[],
        ),
        (
            "tesseract",
            "Tesseract OCR",
            TechnologyKind::Local,
            3,
            &["ocr", "extract_text"],
            &[],
        ),
        (
            "pdf_lib",
            "PDF library fallback",
            TechnologyKind::Local,
            2,
            &[
                "compress", "watermark", "pdf_info", "merge", "split", "rotate", "protect",
                "unlock", "image_to_pdf", "sign", "redact", "page_numbers", "extract_text",
                "extract_images", "flatten", "repair", "compare",
            ],
            &["sign"],
        ),
    ];

    fn family(name: &str) -> OperationFamily {
        // Table entries are compile-time literals that satisfy FAMILY_RE.
        OperationFamily(name.to_string())
    }

    pub(super) fn catalog() -> TechnologyCatalog {
        let families = FAMILIES
            .iter()
            .map(|&(name, label, min_inputs, max_inputs, ordered_inputs)| FamilySpec {
                family: family(name),
                label: label.to_string(),
                min_inputs,
                max_inputs,
                ordered_inputs,
            })
            .collect();

        let technologies = TECHNOLOGIES
            .iter()
            .map(|&(id, label, kind, quality_rating, fams, hard_stop)| TechnologyDescriptor {
                id: TechnologyId::new(id),
                label: label.to_string(),
                kind,
                quality_rating,
                capabilities: fams
                    .iter()
                    .map(|&f| FamilyCapability {
                        family: family(f),
                        fallback: if hard_stop.contains(&f) {
                            FallbackPolicy::HardStop
                        } else {
                            FallbackPolicy::FallThrough
                        },
                    })
                    .collect(),
            })
            .collect();

        TechnologyCatalog {
            families,
            technologies,
        }
    }
}

// ── Sources ──────────────────────────────────────────────────────────────

/// Where the catalog comes from. Fetched at startup and, when configured,
/// again at every session start.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Human-readable origin for logs and errors.
    fn name(&self) -> String;

    async fn fetch(&self) -> Result<TechnologyCatalog, DocOpsError>;
}

/// A fixed, in-memory catalog.
pub struct StaticCatalogSource(pub TechnologyCatalog);

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    fn name(&self) -> String {
        "static".into()
    }

    async fn fetch(&self) -> Result<TechnologyCatalog, DocOpsError> {
        Ok(self.0.clone())
    }
}

/// A catalog stored as a JSON file on disk.
pub struct JsonFileCatalogSource {
    path: PathBuf,
}

impl JsonFileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogSource for JsonFileCatalogSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<TechnologyCatalog, DocOpsError> {
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| DocOpsError::CatalogLoad {
                source_name: self.name(),
                detail: e.to_string(),
            })?;
        debug!("Loaded catalog from {}", self.path.display());
        TechnologyCatalog::from_json_str(&json, &self.name())
    }
}

/// A catalog fetched from a remote endpoint returning the JSON form.
pub struct HttpCatalogSource {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn name(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<TechnologyCatalog, DocOpsError> {
        let load_err = |detail: String| DocOpsError::CatalogLoad {
            source_name: self.url.clone(),
            detail,
        };
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| load_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(load_err(format!("HTTP {}", response.status())));
        }
        let body = response.bytes().await.map_err(|e| load_err(e.to_string()))?;
        let json = String::from_utf8_lossy(&body);
        TechnologyCatalog::from_json_str(&json, &self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fam(name: &str) -> OperationFamily {
        OperationFamily::new(name).unwrap()
    }

    #[test]
    fn builtin_catalog_is_valid() {
        let c = TechnologyCatalog::builtin();
        let rebuilt = TechnologyCatalog::new(c.families().to_vec(), c.technologies().to_vec());
        assert!(rebuilt.is_ok(), "{:?}", rebuilt.err());
        assert!(c.families().len() >= 30);
    }

    #[test]
    fn family_syntax_is_checked() {
        assert!(OperationFamily::new("pdf_to_word").is_ok());
        assert!(OperationFamily::new("PDF to word").is_err());
        assert!(OperationFamily::new("").is_err());
        assert!(OperationFamily::new("9lives").is_err());
    }

    #[test]
    fn parse_family_rejects_undeclared() {
        let c = TechnologyCatalog::builtin();
        assert!(c.parse_family("merge").is_ok());
        assert!(matches!(
            c.parse_family("teleport"),
            Err(DocOpsError::UnknownFamily(_))
        ));
    }

    #[test]
    fn default_order_prefers_cloud_then_rating() {
        let c = TechnologyCatalog::builtin();
        let ids: Vec<String> = c
            .default_order(&fam("ocr"))
            .into_iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(ids, vec!["adobe", "ai_cloud", "tesseract"]);

        let compress = c.default_order(&fam("compress"));
        assert_eq!(compress, vec![TechnologyId::new("adobe"), TechnologyId::new("pdf_lib")]);
    }

    #[test]
    fn signing_is_hard_stop() {
        let c = TechnologyCatalog::builtin();
        let adobe = c.technology(&TechnologyId::new("adobe")).unwrap();
        assert_eq!(adobe.fallback_policy(&fam("sign")), FallbackPolicy::HardStop);
        assert_eq!(adobe.fallback_policy(&fam("compress")), FallbackPolicy::FallThrough);
        // incapable never falls through
        let tesseract = c.technology(&TechnologyId::new("tesseract")).unwrap();
        assert_eq!(tesseract.fallback_policy(&fam("merge")), FallbackPolicy::HardStop);
    }

    #[test]
    fn json_round_trip_through_validation() {
        let c = TechnologyCatalog::builtin();
        let json = serde_json::to_string(&c).unwrap();
        let back = TechnologyCatalog::from_json_str(&json, "test").unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn rejects_family_without_technology() {
        let families = vec![FamilySpec {
            family: fam("orphan"),
            label: String::new(),
            min_inputs: 1,
            max_inputs: Some(1),
            ordered_inputs: false,
        }];
        let err = TechnologyCatalog::new(families, vec![]).unwrap_err();
        assert!(err.to_string().contains("orphan"), "got: {err}");
    }

    #[test]
    fn rejects_undeclared_capability() {
        let json = r#"{
            "families": [{"family": "compress", "min_inputs": 1, "max_inputs": 1}],
            "technologies": [{
                "id": "x", "kind": "local", "quality_rating": 3,
                "capabilities": [{"family": "compress"}, {"family": "merge"}]
            }]
        }"#;
        let err = TechnologyCatalog::from_json_str(json, "inline").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("inline") && msg.contains("merge"), "got: {msg}");
    }

    #[tokio::test]
    async fn json_file_source_loads_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, serde_json::to_string(&TechnologyCatalog::builtin()).unwrap())
            .unwrap();
        let source = JsonFileCatalogSource::new(&path);
        let catalog = source.fetch().await.unwrap();
        assert!(catalog.supports(&fam("merge")));
    }

    #[tokio::test]
    async fn json_file_source_missing_file_errors() {
        let source = JsonFileCatalogSource::new("/nonexistent/catalog.json");
        assert!(matches!(
            source.fetch().await,
            Err(DocOpsError::CatalogLoad { .. })
        ));
    }
}
