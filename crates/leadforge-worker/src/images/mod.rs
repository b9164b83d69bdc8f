// Image pipeline
//
// Makes image content round-trippable between model outputs and model
// inputs: URL hygiene, retried downloads with a hard size cap, format and
// size validation, optimization, screenshot overlays for action traces, and
// the base64-asset rescue that rewrites model JSON in place.

mod fetch;
mod optimize;
mod overlay;
mod rescue;
mod urls;

pub use fetch::ImagePipeline;
pub use optimize::{optimize, validate_format, validate_size, MAX_IMAGE_SIZE_BYTES};
pub use overlay::overlay_screenshot;
pub use rescue::rescue_base64_assets;
pub use urls::{clean_url, deduplicate, is_problematic};
