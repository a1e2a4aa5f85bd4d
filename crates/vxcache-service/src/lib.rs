//! The service layer of vxcache, the disk-backed resource cache of the
//! VoiceXML execution platform.
//!
//! The interpreter, the fetch engine and the prompt subsystem all funnel
//! their downloaded and compiled artifacts through the
//! [`CacheManager`](caching::CacheManager) in [`caching`], which is where
//! all the interesting parts live. [`config`] holds the YAML-backed
//! service configuration, [`logging`] and [`metrics`] the observability
//! plumbing shared with the `vxcache` binary.

pub mod caching;
pub mod config;
pub mod logging;
pub mod metrics;
