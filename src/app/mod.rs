pub mod adapter;
pub mod llm;
pub mod resolver;

pub use adapter::{AdapterKind, InProcessAdapter, LazyBackend, ModelAdapter, OpenAiAdapter, RemoteAdapter};
pub use llm::{GenerateOptions, Llm, ScoringResult};
pub use resolver::{
    get_default_model, model, set_default_model, AliasTable, DefaultModel, DefaultModelCell, ModelDescriptor,
    Resolver, DEFAULT_MODEL,
};
