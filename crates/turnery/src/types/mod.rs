//! Identity newtypes shared across the runtime.

mod entity_id;
mod request_id;

pub use entity_id::EntityId;
pub use request_id::RequestId;
