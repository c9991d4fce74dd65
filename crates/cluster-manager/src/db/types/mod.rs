pub mod action;
pub mod artifact;
pub mod cluster;
