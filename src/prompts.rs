//! Prompts sent to the text/vision generator.
//!
//! Every prompt lives here so the stages stay free of wording. The stage
//! fingerprints include the prompt text, so editing a prompt here
//! invalidates exactly the stages that use it on the next run.
//!
//! Callers can replace the vision checklist via
//! [`crate::config::PipelineConfig::vision_instructions`].

use crate::model::{JobDefaults, ProductSpecs};

/// Default checklist sent with the reference images in the describe stage.
pub const VISION_INSTRUCTIONS: &str = r#"You are inspecting reference photos of a pair of glasses. Report the following, where visible:

1. FRAME MATERIAL
   - Material type (acetate, titanium, stainless steel, ...)
   - Surface texture: marbling pattern and colour distribution, visible acetate layers
   - Finish (matte, glossy, brushed) and thickness differences between front and temples

2. BRANDING
   - Every logo or wordmark: which temple, distance from the hinge in mm
   - Application style (engraved, embossed, printed)

3. LENSES
   - Tint colour (approximate RGB) and gradient direction
   - Coatings: mirror, anti-reflective, polarisation
   - Edge finish

4. HINGES
   - Hinge type (barrel with barrel count, spring, screwless)
   - Hinge and screw materials, screw head type and count per side

5. MEASUREMENTS
   - Cross-check bridge width, temple length and lens width/height against the photos

6. DESIGN DETAILS
   - Rivets, temple tips, nose pads (material, adjustable or fixed)

Answer with precise millimetre values, left/right orientation, RGB codes where relevant,
and PBR estimates (roughness and metallic on a 0-1 scale). Use technical terminology."#;

/// System instructions for drafting the job configuration.
pub const CONFIG_INSTRUCTIONS: &str = r#"Return the configuration for a 3D generation job as a single JSON object and nothing else.

Fields:
- "prompt": the full modeling prompt (string, required)
- "condition_mode": "concat" for multiple views of one object, "fuse" otherwise
- "geometry_file_format": one of "glb", "usdz", "fbx", "obj", "stl"
- "material": "PBR" or "Shaded"
- "quality": one of "high", "medium", "low", "extra-low"
- "tier": "Regular" or "Sketch"
- "use_hyper": boolean
- "addons": "HighPack" or omit
- "seed": optional non-negative integer

Do not include image URLs. Do not wrap the object in prose."#;

/// Ask the generator to structure raw page text into [`ProductSpecs`] JSON.
pub fn specs_extraction_prompt(page_text: &str) -> String {
    format!(
        r#"From the product page text below, extract the technical specification of the glasses.

Return a JSON object with exactly these fields:
- "material": frame material composition and finish (string)
- "lens_type": lens material and optical properties (string)
- "measurements": object mapping measurement name to millimetres (numbers), e.g. {{"lens_width": 52, "bridge_width": 18, "temple_length": 145}}
- "branding": logos and engravings (array of strings, page order)
- "features": technical features such as hinges and nose pads (array of strings, page order)
- "roughness": surface roughness 0-1 (number, optional)
- "metallic": metallic factor 0-1 (number, optional)
- "ior": lens index of refraction (number greater than 1, optional)

Ignore prices, promotions and shipping details. Keep the page's material names. Convert every measurement to millimetres.

Page text:
'''{}'''"#,
        page_text
    )
}

/// Render the scraped specification as the first half of the modeling prompt.
pub fn render_spec_template(specs: &ProductSpecs) -> String {
    format!(
        "Generate a detailed 3D modeling prompt for glasses with these specifications:\n\
         Material: {}\n\
         Lens Type: {}\n\
         Measurements: {}\n\
         Branding: {}\n\
         Features: {}\n\
         Surface: roughness {:.2}, metallic {:.2}, lens IOR {:.2}\n\n\
         Cover material textures and surface properties, lens optics (transparency, \
         refractive index, tint), dimensions to within 0.5 mm, logo positions, hinge \
         and screw details, and any visible wear.",
        specs.material,
        specs.lens_type,
        specs.measurements_summary(),
        specs.branding.join(", "),
        specs.features.join(", "),
        specs.roughness,
        specs.metallic,
        specs.ior,
    )
}

/// Combine rendered specs and the visual analysis into the final prompt request.
pub fn synthesis_prompt(rendered_specs: &str, visual_analysis: &str) -> String {
    format!(
        "Merge the product specification and the visual analysis below into one final \
         3D modeling prompt.\n\n\
         Product specification:\n{}\n\n\
         Visual analysis:\n{}\n\n\
         The prompt must put measurable physical properties first, state PBR values \
         (roughness, metallic), describe the lens optics, describe hinges and screws \
         precisely, and keep the brand markings.\n\n\
         Reply with the prompt text only.",
        rendered_specs, visual_analysis
    )
}

/// Request a job configuration draft for `prompt`, showing the desired defaults.
pub fn config_request(prompt: &str, image_count: usize, defaults: &JobDefaults) -> String {
    let defaults_json = serde_json::json!({
        "condition_mode": defaults.condition_mode,
        "geometry_file_format": defaults.output_format,
        "material": defaults.material_mode,
        "quality": defaults.quality_tier.quality,
        "tier": defaults.quality_tier.tier,
        "use_hyper": defaults.feature_flags.use_hyper,
        "addons": defaults.feature_flags.addons,
    });
    format!(
        "{}\n\nModeling prompt:\n{}\n\nReference views: {}\n\nUse these values unless the prompt clearly requires otherwise:\n{}",
        CONFIG_INSTRUCTIONS, prompt, image_count, defaults_json
    )
}
