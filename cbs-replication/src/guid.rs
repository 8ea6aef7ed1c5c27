use anyhow::{bail, Error};

/// A 160-bit message content identifier (spec glossary: GUID).
pub const GUID_BYTES: usize = 20;

pub fn encode(digest: &[u8; GUID_BYTES]) -> String {
    hex::encode(digest)
}

pub fn decode(s: &str) -> Result<[u8; GUID_BYTES], Error> {
    if s.len() != GUID_BYTES * 2 {
        bail!("invalid guid length ({} != {})", s.len(), GUID_BYTES * 2);
    }
    let bytes = hex::decode(s).map_err(|err| anyhow::anyhow!("invalid guid '{s}' - {err}"))?;
    let mut out = [0u8; GUID_BYTES];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let digest = [7u8; GUID_BYTES];
        let hex = encode(&digest);
        assert_eq!(hex.len(), 40);
        assert_eq!(decode(&hex).unwrap(), digest);
    }

    #[test]
    fn rejects_short_guid() {
        assert!(decode("abcd").is_err());
    }
}
