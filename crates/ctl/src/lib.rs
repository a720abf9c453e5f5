//! Helper tool for working with a remote spawnpoint platform: create,
//! clone, upload and download lambdas, manage aliases and run actions from
//! a local working copy.

pub mod archive;
pub mod client;
pub mod control;
