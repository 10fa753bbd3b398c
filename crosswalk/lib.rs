#![deny(dead_code)]
#![deny(unused_imports)]

pub mod adjust;
pub mod basis;
pub mod data;
pub mod design;
pub mod fit;
pub mod model;
