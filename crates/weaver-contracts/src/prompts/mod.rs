mod modules;
mod refine;
mod weights;

pub use modules::{build_prompt, raw_prompt, ModuleSpec, TagSpec, NEUTRAL_WEIGHT_EPSILON};
pub use refine::{
    compile_refined_prompt, compose_refined_prompt, CRITIQUE_WEIGHT, STYLE_NEGATIVE,
    STYLE_POSITIVE, STYLE_TAG_WEIGHT,
};
pub use weights::{compile, describe};
