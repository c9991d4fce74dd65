pub(crate) mod actions;
pub(crate) mod cluster;
pub(crate) mod configs;
pub(crate) mod utils;
pub(crate) mod visits;
