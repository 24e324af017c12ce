pub mod registry;
pub mod synthetic;
pub mod weights;

pub use registry::{
    backend_kind, register, BackendCreator, BackendRegistry, BackendSpec, DEFAULT_LOCAL_KIND, LLAMA_CPP_KIND, RANDOM_KIND,
    REGISTRY,
};
pub use synthetic::RandomLm;
pub use weights::{select_device, CheckpointFiles, GgufLlama, IncrementalLm, SafetensorsLlama, StepModel};
