mod inspect;
mod loader;

pub use inspect::{state_dict_key, stored_shapes, ShapeMap};
pub use loader::{compare_shapes, load_checkpoint, CheckpointConfig, CheckpointFormat};
