pub mod common;
pub mod embed;
pub mod exports;
pub mod imports;
pub mod info;
