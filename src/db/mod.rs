pub mod creator;
pub mod delayed;
pub mod queue;
pub mod subscription;
