mod registry;

pub use registry::{
    ModelChoice, ModelRegistry, ModelSpec, CAP_EDIT, CAP_IMAGE, CAP_TEXT, CAP_VISION,
};
