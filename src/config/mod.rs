mod hash;
mod loader;
mod paths;
mod schema;

pub use hash::{profile_hash, server_config_hash};
pub use loader::{load_profile, profile_path};
pub use paths::Paths;
pub use schema::{AuthSpec, Profile, ServerConfig, Settings};
