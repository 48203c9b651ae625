pub mod advice;
pub mod chat;
pub mod config;
pub mod events;
pub mod products;

pub use advice::{extract_keywords, AdviceResponse, AnalysisResult, AnalysisTask, KEYWORD_MARKER};
pub use config::{AppConfig, MerchantConfig, ModelConfig, ModelsConfig};
pub use events::{EventPayload, EventWriter};
pub use products::{normalize_rating_share, AggregatedSuggestions, ProductRecord};
