//! Deterministic state and wire encoding
//!
//! Grain state blobs, transaction logs, and invocation envelopes are
//! prost messages with explicit field tags. Tag numbers are a wire
//! format: they must stay stable across releases. JSON is reserved for
//! human-readable surfaces (config, seed files, HTTP bodies, session
//! records).

use prost::Message;

use crate::error::{Error, Result};

/// Marker for types that can serve as persisted grain state.
///
/// Blanket-implemented for every prost message; the bound exists so
/// state-generic APIs read as intent rather than as codec plumbing.
pub trait GrainState: Message + Default + Clone + Send + Sync + 'static {}

impl<T> GrainState for T where T: Message + Default + Clone + Send + Sync + 'static {}

/// Encode a tagged record into its payload bytes
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// Decode payload bytes into a tagged record.
///
/// Unknown fields are skipped and absent fields take their defaults,
/// which is what makes the format forward-compatible.
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct SampleV1 {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint64, tag = "2")]
        count: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct SampleV2 {
        #[prost(string, tag = "1")]
        name: String,
        #[prost(uint64, tag = "2")]
        count: u64,
        #[prost(string, tag = "3")]
        added_later: String,
    }

    #[test]
    fn newer_reader_accepts_older_payload() {
        let old = SampleV1 {
            name: "frost-blade".into(),
            count: 3,
        };
        let decoded: SampleV2 = decode(&encode(&old)).unwrap();
        assert_eq!(decoded.name, "frost-blade");
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.added_later, "");
    }

    #[test]
    fn older_reader_skips_unknown_fields() {
        let new = SampleV2 {
            name: "frost-blade".into(),
            count: 3,
            added_later: "affix".into(),
        };
        let decoded: SampleV1 = decode(&encode(&new)).unwrap();
        assert_eq!(decoded.name, "frost-blade");
        assert_eq!(decoded.count, 3);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode::<SampleV1>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
