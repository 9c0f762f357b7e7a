pub mod head;
pub mod volume;

pub use head::{HeadPage, VOLUME_SIGNATURE, VOLUME_VERSION};
pub use volume::Volume;
