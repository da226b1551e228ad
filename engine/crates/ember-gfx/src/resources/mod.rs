pub mod buffer;
pub mod heap;
pub mod pipeline;
pub mod texture;
