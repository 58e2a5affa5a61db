pub mod clock;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use clock::*;
pub use error::*;
pub use models::*;
pub use router::create_consultation_queue_router;
pub use services::*;
