//! Version-tagged persistence for registry and election state.
//!
//! Dumps carry a magic client string and a payload checksum; any mismatch
//! on load surfaces as a `Storage` error so the caller starts a fresh sync
//! instead of trusting a stale or foreign format.

use std::fs;
use std::path::Path;

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ferrite_crypto::hash::checksum32;

use crate::error::{MasternodeError, Result};

pub const CLIENT_NAME: &str = "FerriteCore";

/// Format tag for registry dumps.
pub fn registry_magic() -> String {
    format!("{}-MasternodeRegistry-Version-1", CLIENT_NAME)
}

/// Format tag for election dumps.
pub fn election_magic() -> String {
    format!("{}-PaymentElection-Version-1", CLIENT_NAME)
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: String,
    checksum: [u8; 4],
    payload: Vec<u8>,
}

pub fn save<T: Serialize>(path: &Path, magic: &str, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)
        .map_err(|e| MasternodeError::Storage(format!("serialize: {}", e)))?;
    let envelope = Envelope {
        magic: magic.to_string(),
        checksum: checksum32(&payload),
        payload,
    };
    let bytes = bincode::serialize(&envelope)
        .map_err(|e| MasternodeError::Storage(format!("serialize envelope: {}", e)))?;
    fs::write(path, bytes)?;
    info!("store -- wrote {} ({})", path.display(), magic);
    Ok(())
}

pub fn load<T: DeserializeOwned>(path: &Path, magic: &str) -> Result<T> {
    let bytes = fs::read(path)?;
    let envelope: Envelope = bincode::deserialize(&bytes)
        .map_err(|e| MasternodeError::Storage(format!("corrupt envelope: {}", e)))?;
    if envelope.magic != magic {
        return Err(MasternodeError::Storage(format!(
            "format mismatch: found '{}', expected '{}'",
            envelope.magic, magic
        )));
    }
    if checksum32(&envelope.payload) != envelope.checksum {
        return Err(MasternodeError::Storage("payload checksum mismatch".into()));
    }
    bincode::deserialize(&envelope.payload)
        .map_err(|e| MasternodeError::Storage(format!("corrupt payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trip_and_magic_mismatch() {
        let dir = std::env::temp_dir().join("ferrite-store-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mncache.dat");

        let mut value: HashMap<String, u64> = HashMap::new();
        value.insert("height".into(), 42);
        save(&path, &registry_magic(), &value).unwrap();

        let loaded: HashMap<String, u64> = load(&path, &registry_magic()).unwrap();
        assert_eq!(loaded, value);

        let err = load::<HashMap<String, u64>>(&path, &election_magic()).unwrap_err();
        assert!(matches!(err, MasternodeError::Storage(_)));

        fs::remove_file(&path).unwrap();
    }
}
