//! Binary encoding of persisted records.
//!
//! Everything written to the cache stores goes through these two functions so the on-disk
//! format changes in exactly one place.

#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(#[from] bincode::Error);

pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        size: u32,
        tag: String,
    }

    #[test]
    fn truncated_input_is_an_error() {
        let buf = encode(&Record {
            size: 7,
            tag: "sweep-1".to_string(),
        })
        .unwrap();
        assert!(decode::<Record>(&buf[..buf.len() - 2]).is_err());
        assert_eq!(
            decode::<Record>(&buf).unwrap(),
            Record {
                size: 7,
                tag: "sweep-1".to_string()
            }
        );
    }
}
