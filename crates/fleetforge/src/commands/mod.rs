pub mod apply;
pub mod create;
pub mod delete;
pub mod edit;
pub mod get;
pub mod use_cluster;
