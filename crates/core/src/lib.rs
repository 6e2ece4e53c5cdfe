pub mod error;
pub mod events;
pub mod models;
pub mod traits;

pub use error::*;
pub use events::*;
pub use models::*;
pub use traits::*;
