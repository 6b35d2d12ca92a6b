// Services layer
//
// Business logic between the HTTP handlers and the position core.

mod position;

pub use position::{PositionService, RegistrationError};
