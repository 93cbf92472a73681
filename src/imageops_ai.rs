pub mod mask;
pub mod refine;

pub use mask::cutout;
pub use refine::refine_mask;
