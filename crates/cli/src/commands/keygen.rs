//! `attestgate keygen` — force-generate a new signing key.

use std::path::Path;

use attestgate_crypto::{default_key_path, Keystore};

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = default_key_path();
    let keystore = generate_at(&path)?;
    println!("generated signing key at {}", path.display());
    println!("public key: {}", keystore.public_key_base64());
    Ok(())
}

fn generate_at(path: &Path) -> Result<Keystore, Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "refusing to overwrite existing key at {} — remove it first if this is intentional",
            path.display()
        )
        .into());
    }
    Ok(Keystore::load_or_generate(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_overwrite_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");
        std::fs::write(&path, "already here").unwrap();

        let result = generate_at(&path);
        assert!(result.is_err());
    }

    #[test]
    fn generates_key_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.hex");

        let keystore = generate_at(&path).unwrap();
        assert!(!keystore.public_key_base64().is_empty());
        assert!(path.exists());
    }
}
