//! Stable content hashes for server configs and whole profiles.
//!
//! The catalog and embedding caches key their staleness checks on these
//! digests, so the serialisation must be canonical: BTreeMap fields keep map
//! keys sorted and struct field order is fixed by the type definitions.

use sha2::{Digest, Sha256};

use super::schema::{Profile, ServerConfig};

/// Hash one server's config. Any change to command, args, env, url or auth
/// produces a new digest and invalidates that server's cache slice.
pub fn server_config_hash(config: &ServerConfig) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Hash the whole profile: sorted `(serverName, serverHash)` pairs. Adding,
/// removing or editing any server changes the profile hash.
pub fn profile_hash(profile: &Profile) -> String {
    let mut hasher = Sha256::new();
    for (name, config) in &profile.servers {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(server_config_hash(config).as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
