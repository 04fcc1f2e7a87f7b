pub mod acquire;
pub mod app;
pub mod catalog;
pub mod compose;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod geometry;
pub mod mosaic;
pub mod output;
pub mod query;
pub mod raster;
pub mod store;
pub mod stretch;
