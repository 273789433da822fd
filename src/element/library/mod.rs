//! Concrete elements and policies

mod clip;
mod keyframe;
mod live;
mod playlist;
mod switching;

pub use clip::{ClipElement, ClipOptions};
pub use keyframe::{KeyframeElement, KeyframeOptions};
pub use live::LiveElement;
pub use playlist::PlaylistPolicy;
pub use switching::SwitchingElement;
