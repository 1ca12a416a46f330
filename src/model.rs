//! Domain types flowing between pipeline stages.
//!
//! Every type here is serde-serialisable because every stage output ends up
//! in the checkpoint store as JSON and is read back on resume.

use crate::error::{ArtifactWarning, PipelineError};
use crate::extract::{number_like, FieldType, Schema};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

// ── Stages ───────────────────────────────────────────────────────────────

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    Describe,
    SynthesizePrompt,
    BuildConfig,
    GenerateModel,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Scrape,
        Stage::Describe,
        Stage::SynthesizePrompt,
        Stage::BuildConfig,
        Stage::GenerateModel,
    ];

    /// Stable name used in checkpoint paths and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Describe => "describe",
            Stage::SynthesizePrompt => "synthesize_prompt",
            Stage::BuildConfig => "build_config",
            Stage::GenerateModel => "generate_model",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Run identity ─────────────────────────────────────────────────────────

/// Identifier grouping the checkpoints of one pipeline run.
///
/// Restricted to `[A-Za-z0-9._-]` because it becomes a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(PipelineError::InvalidConfig(format!(
                "run id '{}' must be 1-128 characters of [A-Za-z0-9._-]",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Deterministic run id for a product URL, so repeated invocations for
    /// the same page resume each other by default.
    pub fn for_product(product_url: &str) -> Self {
        Self(format!("{}-{}", product_id_for(product_url), short_hash(product_url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a filesystem-safe product identifier from its page URL.
///
/// Uses the last non-empty path segment (`.../durand/p/eyeglasses` style
/// URLs fall back to earlier segments only through the hash).
pub fn product_id_for(product_url: &str) -> String {
    let segment = reqwest::Url::parse(product_url).ok().and_then(|u| {
        u.path_segments().and_then(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .last()
                .map(|s| s.to_string())
        })
    });

    let slug = segment.map(|s| slugify(&s)).unwrap_or_default();
    if slug.is_empty() {
        format!("product-{}", short_hash(product_url))
    } else {
        slug
    }
}

fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').chars().take(64).collect()
}

fn short_hash(s: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(s.as_bytes()));
    digest[..10].to_string()
}

// ── Scrape output ────────────────────────────────────────────────────────

fn default_roughness() -> f64 {
    0.4
}

fn default_ior() -> f64 {
    1.49
}

/// Structured specification of a product, as scraped from its page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpecs {
    /// Frame material composition and finish.
    pub material: String,
    /// Lens material and optical properties.
    pub lens_type: String,
    /// Named measurements in millimetres (e.g. `lens_width → 52.0`).
    #[serde(deserialize_with = "de_millimetres")]
    pub measurements: BTreeMap<String, f64>,
    /// Branding elements, in page order.
    pub branding: Vec<String>,
    /// Technical features, in page order.
    pub features: Vec<String>,
    /// Surface roughness, 0–1.
    #[serde(default = "default_roughness")]
    pub roughness: f64,
    /// Metallic factor, 0–1.
    #[serde(default)]
    pub metallic: f64,
    /// Lens index of refraction, > 1.
    #[serde(default = "default_ior")]
    pub ior: f64,
}

impl ProductSpecs {
    /// Schema used when a model structures page text into specs.
    pub fn schema() -> Schema {
        Schema::new("ProductSpecs")
            .required("material", FieldType::String)
            .required("lens_type", FieldType::String)
            .required("measurements", FieldType::NumberMap)
            .required("branding", FieldType::StringList)
            .required("features", FieldType::StringList)
            .optional("roughness", FieldType::UnitInterval)
            .optional("metallic", FieldType::UnitInterval)
            .optional("ior", FieldType::GreaterThan(1.0))
    }

    /// Measurements rendered as `name: 52mm, name: 18mm`.
    pub fn measurements_summary(&self) -> String {
        self.measurements
            .iter()
            .map(|(k, v)| format!("{}: {}mm", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn de_millimetres<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| match number_like(&v) {
            Some(n) => Ok((k, n)),
            None => Err(serde::de::Error::custom(format!(
                "measurement '{}' is not a millimetre value: {}",
                k, v
            ))),
        })
        .collect()
}

/// Reference to a product image: a URL or a local path.
///
/// The pipeline only ever reads the referenced image; it never modifies or
/// deletes the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn locator(&self) -> &str {
        &self.0
    }

    pub fn is_url(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    pub fn as_path(&self) -> Option<&Path> {
        (!self.is_url()).then(|| Path::new(&self.0))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the scrape stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPage {
    pub specs: ProductSpecs,
    pub images: Vec<ImageRef>,
}

// ── Prompt ───────────────────────────────────────────────────────────────

static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*[A-Za-z_][A-Za-z0-9_.]*\s*\}\}|\{[A-Za-z_][A-Za-z0-9_]*\}")
        .unwrap()
});

/// A validated 3D-modeling prompt: non-empty, no unresolved placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationPrompt(String);

impl GenerationPrompt {
    pub fn new(text: impl Into<String>) -> Result<Self, PipelineError> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::InvalidPrompt("prompt is empty".into()));
        }
        if let Some(m) = RE_PLACEHOLDER.find(&text) {
            return Err(PipelineError::InvalidPrompt(format!(
                "unresolved template placeholder '{}'",
                m.as_str()
            )));
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GenerationPrompt {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GenerationPrompt> for String {
    fn from(p: GenerationPrompt) -> Self {
        p.0
    }
}

impl fmt::Display for GenerationPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Job configuration ────────────────────────────────────────────────────

/// How multiple reference views are combined by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionMode {
    Fuse,
    /// Multi-view concatenation (default; suits front + side views).
    #[default]
    Concat,
}

impl ConditionMode {
    pub const NAMES: &'static [&'static str] = &["fuse", "concat"];
}

/// Mesh file format produced by the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Glb,
    Usdz,
    Fbx,
    Obj,
    Stl,
}

impl OutputFormat {
    pub const NAMES: &'static [&'static str] = &["glb", "usdz", "fbx", "obj", "stl"];

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Glb => "glb",
            OutputFormat::Usdz => "usdz",
            OutputFormat::Fbx => "fbx",
            OutputFormat::Obj => "obj",
            OutputFormat::Stl => "stl",
        }
    }
}

/// Material model requested from the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaterialMode {
    #[default]
    #[serde(rename = "PBR")]
    Pbr,
    Shaded,
}

impl MaterialMode {
    pub const NAMES: &'static [&'static str] = &["PBR", "Shaded"];
}

/// Mesh density / polygon budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quality {
    #[default]
    High,
    Medium,
    Low,
    ExtraLow,
}

impl Quality {
    pub const NAMES: &'static [&'static str] = &["high", "medium", "low", "extra-low"];
}

/// Generation tier offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Tier {
    #[default]
    Regular,
    Sketch,
}

impl Tier {
    pub const NAMES: &'static [&'static str] = &["Regular", "Sketch"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityTier {
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub use_hyper: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<String>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_hyper: true,
            addons: Some("HighPack".to_string()),
        }
    }
}

/// PBR hints forwarded to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialParameters {
    pub roughness: f64,
    pub metallic: f64,
}

/// Everything the remote job needs. Serialises to the service's wire document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub prompt: String,
    #[serde(rename = "input_image_urls")]
    pub image_refs: Vec<ImageRef>,
    pub condition_mode: ConditionMode,
    #[serde(rename = "geometry_file_format")]
    pub output_format: OutputFormat,
    #[serde(flatten)]
    pub quality_tier: QualityTier,
    #[serde(rename = "material")]
    pub material_mode: MaterialMode,
    #[serde(flatten)]
    pub feature_flags: FeatureFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_parameters: Option<MaterialParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_condition: Option<Vec<u32>>,
}

impl JobConfig {
    /// Schema for a model-drafted configuration. `input_image_urls` is not
    /// part of it: image references always come from the scrape stage.
    pub fn draft_schema() -> Schema {
        Schema::new("JobConfig")
            .required("prompt", FieldType::NonEmptyString)
            .optional("condition_mode", FieldType::OneOf(ConditionMode::NAMES))
            .optional("geometry_file_format", FieldType::OneOf(OutputFormat::NAMES))
            .optional("material", FieldType::OneOf(MaterialMode::NAMES))
            .optional("quality", FieldType::OneOf(Quality::NAMES))
            .optional("tier", FieldType::OneOf(Tier::NAMES))
            .optional("use_hyper", FieldType::Bool)
            .optional("addons", FieldType::String)
            .optional("seed", FieldType::UnsignedInteger)
            .optional("bbox_condition", FieldType::Any)
    }

    /// Check the submission invariants.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("prompt is empty".into()));
        }
        if self.image_refs.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "image_refs must contain at least one image".into(),
            ));
        }
        if let Some(i) = self.image_refs.iter().position(|r| r.locator().trim().is_empty()) {
            return Err(PipelineError::InvalidConfig(format!("image_refs[{}] is empty", i)));
        }
        Ok(())
    }
}

/// Job configuration as drafted by the generator; omitted fields fall back
/// to [`JobDefaults`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigDraft {
    pub prompt: String,
    #[serde(default)]
    pub condition_mode: Option<ConditionMode>,
    #[serde(default, rename = "geometry_file_format")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, rename = "material")]
    pub material_mode: Option<MaterialMode>,
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub use_hyper: Option<bool>,
    #[serde(default)]
    pub addons: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub bbox_condition: Option<Vec<u32>>,
}

/// Settings applied to every job unless the draft overrides them.
///
/// `output_format` always comes from here because the artifact paths depend
/// on it. An explicit `seed` here wins over a drafted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefaults {
    pub condition_mode: ConditionMode,
    pub output_format: OutputFormat,
    pub quality_tier: QualityTier,
    pub material_mode: MaterialMode,
    pub feature_flags: FeatureFlags,
    pub seed: Option<u64>,
    /// Forward roughness/metallic from the scraped specs.
    pub attach_material_parameters: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            condition_mode: ConditionMode::default(),
            output_format: OutputFormat::default(),
            quality_tier: QualityTier::default(),
            material_mode: MaterialMode::default(),
            feature_flags: FeatureFlags::default(),
            seed: None,
            attach_material_parameters: true,
        }
    }
}

impl JobDefaults {
    /// Merge a draft into a full configuration.
    ///
    /// The image references always come from `images`; the model never
    /// chooses them.
    pub fn apply(&self, draft: ConfigDraft, images: &[ImageRef], specs: &ProductSpecs) -> JobConfig {
        let material_parameters = self.attach_material_parameters.then_some(MaterialParameters {
            roughness: specs.roughness,
            metallic: specs.metallic,
        });
        JobConfig {
            prompt: draft.prompt.trim().to_string(),
            image_refs: images.to_vec(),
            condition_mode: draft.condition_mode.unwrap_or(self.condition_mode),
            output_format: self.output_format,
            quality_tier: QualityTier {
                quality: draft.quality.unwrap_or(self.quality_tier.quality),
                tier: draft.tier.unwrap_or(self.quality_tier.tier),
            },
            material_mode: draft.material_mode.unwrap_or(self.material_mode),
            feature_flags: FeatureFlags {
                use_hyper: draft.use_hyper.unwrap_or(self.feature_flags.use_hyper),
                addons: draft.addons.or_else(|| self.feature_flags.addons.clone()),
            },
            seed: self.seed.or(draft.seed),
            material_parameters,
            bbox_condition: draft.bbox_condition,
        }
    }
}

// ── Job lifecycle ────────────────────────────────────────────────────────

/// Opaque identifier issued by the job service at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote locations of a finished job's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub mesh: String,
    pub textures: Vec<String>,
}

/// Status reported by one poll of the job service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    /// Still running; carries any new progress messages.
    Running(Vec<String>),
    Succeeded(ArtifactRefs),
    Failed(String),
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running(_) => "running",
            JobStatus::Succeeded(_) => "succeeded",
            JobStatus::Failed(_) => "failed",
        }
    }
}

/// A texture downloaded to local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureFile {
    /// Position in the job's texture list.
    pub index: usize,
    pub path: PathBuf,
}

/// Downloaded outputs of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub product_id: String,
    /// `{artifact_dir}/{product_id}`
    pub directory: PathBuf,
    pub mesh: PathBuf,
    /// Successfully fetched textures, ordered by index.
    pub textures: Vec<TextureFile>,
    /// Textures that were skipped.
    #[serde(default)]
    pub warnings: Vec<ArtifactWarning>,
}

/// Where a product's artifacts are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub root: PathBuf,
    pub product_id: String,
    pub format: OutputFormat,
}

impl ArtifactLocation {
    pub fn directory(&self) -> PathBuf {
        self.root.join(&self.product_id)
    }

    pub fn mesh_path(&self) -> PathBuf {
        self.directory()
            .join(format!("model.{}", self.format.extension()))
    }

    /// `textures/texture_{index}.{ext}`; the extension follows the URL, png otherwise.
    pub fn texture_path(&self, index: usize, url: &str) -> PathBuf {
        let ext = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(|last| last.to_string()))
            })
            .and_then(|last| last.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
            .filter(|e| matches!(e.as_str(), "png" | "jpg" | "jpeg" | "webp"))
            .unwrap_or_else(|| "png".to_string());
        self.directory()
            .join("textures")
            .join(format!("texture_{}.{}", index, ext))
    }
}
