//! secp256k1 keystore and canonical-JSON signing for the attestgate gateway.

pub mod canonical;
pub mod keystore;

pub use canonical::canonicalize;
pub use keystore::{default_key_path, Keystore};
