//! Configuration loading and the user→path directory (spec §4.3, §6.3, §6.4).

mod config;
mod resolver;
mod user_map;

pub use config::Config;
pub use resolver::{PathResolver, UserPaths};
pub use user_map::UserPathMap;
