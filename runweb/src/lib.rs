// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler helpers for convenience
pub use handlers::{init_tracing, load_settings, resolve_checkpoint};
