pub mod aggregation;
pub mod catalog;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fetcher;
pub mod governance;
pub mod lineage;
pub mod mapper;
pub mod matcher;
pub mod metrics_consts;
pub mod pipeline;
pub mod sql;
pub mod store;
pub mod strategy;
pub mod transform;
pub mod writer;
