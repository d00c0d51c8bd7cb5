#![allow(dead_code)]

pub mod dom;
pub mod loops;
pub mod mask;

pub use dom::DomTree;
pub use loops::{LoopForest, LoopId, LoopInfo};
pub use mask::MaskAnalysis;
