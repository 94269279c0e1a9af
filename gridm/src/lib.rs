/*
 * gridm keeps the Services of ServiceGrids in place and projects federated
 * ServiceGrids into the namespaces they target.
 */

pub mod client;
pub mod config;
pub mod controller;
pub mod errors;
pub mod events;
pub mod fedservicegrid;
pub mod informer;
pub mod refmanager;
pub mod servicegrid;
pub mod util;

#[cfg(test)]
mod testing;
