pub mod bar;
pub mod order;
pub mod snapshot;
