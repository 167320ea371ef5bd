//! On-disk identity for a node: the subscriber keypair and the rhizome
//! author secret, each a hex file in the instance directory, created on
//! first start.

use std::path::Path;

use mycel_identity::{Keypair, RhizomeSecret};
use rand_core::OsRng;

pub fn load_or_create_keypair(dir: &Path) -> std::io::Result<Keypair> {
    let path = dir.join("identity");
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let bytes = hex::decode(text.trim()).map_err(invalid)?;
            Keypair::from_secret_slice(&bytes).map_err(invalid)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate(OsRng);
            std::fs::create_dir_all(dir)?;
            std::fs::write(&path, hex::encode(keypair.secret_bytes()))?;
            log::info!("generated new identity {}", keypair.sid());
            Ok(keypair)
        }
        Err(err) => Err(err),
    }
}

pub fn load_or_create_rhizome_secret(dir: &Path) -> std::io::Result<RhizomeSecret> {
    let path = dir.join("rhizome.secret");
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let bytes = hex::decode(text.trim()).map_err(invalid)?;
            let bytes = <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| invalid("rhizome secret must be 32 bytes"))?;
            Ok(RhizomeSecret::from_bytes(bytes))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let secret = RhizomeSecret::generate(OsRng);
            std::fs::create_dir_all(dir)?;
            std::fs::write(&path, hex::encode(secret.as_bytes()))?;
            Ok(secret)
        }
        Err(err) => Err(err),
    }
}

fn invalid(err: impl ToString) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_persists_across_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = load_or_create_keypair(dir.path()).expect("create");
        let second = load_or_create_keypair(dir.path()).expect("reload");
        assert_eq!(first.sid(), second.sid());
    }

    #[test]
    fn rhizome_secret_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = load_or_create_rhizome_secret(dir.path()).expect("create");
        let second = load_or_create_rhizome_secret(dir.path()).expect("reload");
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn corrupt_identity_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("identity"), "not-hex").expect("write");
        assert!(load_or_create_keypair(dir.path()).is_err());
    }
}
