//! Per-stage inputs: what each stage fingerprints and how raw generator
//! output becomes the stage's typed result.
//!
//! A stage's fingerprint covers everything that can change its output:
//! the upstream payloads it consumes and the exact request text it sends.
//! Hashing the request text (rather than a template version number) means
//! editing a prompt invalidates exactly the stages that use it.

use crate::checkpoint::Fingerprint;
use crate::error::PipelineError;
use crate::extract::{extract_as, strip_fences};
use crate::model::{
    ArtifactLocation, ConfigDraft, GenerationPrompt, JobConfig, JobDefaults, ProductPage, Stage,
};
use crate::prompts;

pub fn scrape_fingerprint(product_url: &str, thumbnail_indices: &[usize]) -> Result<Fingerprint, PipelineError> {
    Ok(Fingerprint::builder(Stage::Scrape)
        .field("product_url", product_url)?
        .field("thumbnail_indices", thumbnail_indices)?
        .finish())
}

pub fn describe_fingerprint(
    page: &ProductPage,
    instructions: &str,
    image_contrast: Option<f32>,
) -> Result<Fingerprint, PipelineError> {
    Ok(Fingerprint::builder(Stage::Describe)
        .field("images", &page.images)?
        .field("instructions", instructions)?
        .field("image_contrast", &image_contrast)?
        .finish())
}

/// Request text for the synthesize stage.
pub fn synthesis_request(page: &ProductPage, description: &str) -> String {
    let rendered = prompts::render_spec_template(&page.specs);
    prompts::synthesis_prompt(&rendered, description)
}

pub fn synthesize_fingerprint(request: &str) -> Result<Fingerprint, PipelineError> {
    Ok(Fingerprint::builder(Stage::SynthesizePrompt)
        .field("request", request)?
        .finish())
}

/// Turn the generator's reply into a validated prompt.
///
/// Models sometimes fence or quote a plain-text answer; both are stripped
/// before validation.
pub fn parse_prompt(raw: &str) -> Result<GenerationPrompt, PipelineError> {
    let text = strip_fences(raw);
    let text = text.trim().trim_matches('"').trim();
    GenerationPrompt::new(text)
}

/// Request text for the build-config stage.
pub fn config_request(prompt: &GenerationPrompt, page: &ProductPage, defaults: &JobDefaults) -> String {
    prompts::config_request(prompt.as_str(), page.images.len(), defaults)
}

pub fn build_config_fingerprint(
    request: &str,
    page: &ProductPage,
    defaults: &JobDefaults,
) -> Result<Fingerprint, PipelineError> {
    Ok(Fingerprint::builder(Stage::BuildConfig)
        .field("request", request)?
        .field("images", &page.images)?
        .field("roughness", &page.specs.roughness)?
        .field("metallic", &page.specs.metallic)?
        .field("defaults", defaults)?
        .finish())
}

/// Extract the drafted configuration and merge it with the defaults.
pub fn parse_job_config(raw: &str, page: &ProductPage, defaults: &JobDefaults) -> Result<JobConfig, PipelineError> {
    let draft: ConfigDraft = extract_as(raw, &JobConfig::draft_schema())?;
    let config = defaults.apply(draft, &page.images, &page.specs);
    config.validate()?;
    Ok(config)
}

pub fn generate_fingerprint(config: &JobConfig, location: &ArtifactLocation) -> Result<Fingerprint, PipelineError> {
    Ok(Fingerprint::builder(Stage::GenerateModel)
        .field("job_config", config)?
        .field("location", location)?
        .finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageRef, ProductSpecs};
    use std::collections::BTreeMap;

    fn page() -> ProductPage {
        ProductPage {
            specs: ProductSpecs {
                material: "acetate".into(),
                lens_type: "polycarbonate".into(),
                measurements: BTreeMap::from([("lens_width".into(), 52.0)]),
                branding: vec![],
                features: vec![],
                roughness: 0.4,
                metallic: 0.0,
                ior: 1.49,
            },
            images: vec![ImageRef::new("https://img/1.jpg"), ImageRef::new("https://img/4.jpg")],
        }
    }

    #[test]
    fn prompt_is_unfenced_and_unquoted() {
        let p = parse_prompt("```\n\"A glossy acetate frame\"\n```").unwrap();
        assert_eq!(p.as_str(), "A glossy acetate frame");
        assert!(matches!(parse_prompt("```\n```"), Err(PipelineError::InvalidPrompt(_))));
    }

    #[test]
    fn job_config_takes_images_from_page() {
        let raw = r#"Sure! {"prompt": "glasses", "input_image_urls": ["https://evil/x.jpg"], "quality": "medium"}"#;
        let cfg = parse_job_config(raw, &page(), &JobDefaults::default()).unwrap();
        assert_eq!(cfg.image_refs, page().images);
        assert_eq!(cfg.quality_tier.quality, crate::model::Quality::Medium);
    }

    #[test]
    fn missing_prompt_is_schema_violation() {
        let err = parse_job_config(r#"{"quality": "high"}"#, &page(), &JobDefaults::default()).unwrap_err();
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn describe_fingerprint_tracks_instructions() {
        let a = describe_fingerprint(&page(), "look closely", Some(10.0)).unwrap();
        let b = describe_fingerprint(&page(), "look closer", Some(10.0)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, describe_fingerprint(&page(), "look closely", Some(10.0)).unwrap());
    }
}
