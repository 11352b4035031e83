//! Binary encoding of cluster state bundles

use super::compression::{CompressionConfig, CompressionType, Compressor};
use crate::state::{ClusterState, ClusterStateBundle};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ENVELOPE_MAGIC: &[u8; 4] = b"FSCB";
const ENVELOPE_VERSION: u8 = 1;
/// magic(4) + version(1) + compression(1) + uncompressed length(4) + crc32(4)
const ENVELOPE_HEADER_LEN: usize = 14;

/// Wire form of a bundle: compression tag, uncompressed length and the
/// (possibly compressed) document bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedClusterStateBundle {
    pub compression_type: CompressionType,
    pub uncompressed_length: i32,
    pub payload: Vec<u8>,
}

/// Encodes bundles for the push RPC, where compression metadata travels in
/// separate parameters.
pub trait ClusterStateBundleCodec {
    fn encode(&self, bundle: &ClusterStateBundle) -> Result<EncodedClusterStateBundle>;

    fn decode(&self, encoded: &EncodedClusterStateBundle) -> Result<ClusterStateBundle>;
}

/// Encodes bundles into a single self-describing byte array.
pub trait EnvelopedClusterStateBundleCodec {
    fn encode_with_envelope(&self, bundle: &ClusterStateBundle) -> Result<Vec<u8>>;

    fn decode_with_envelope(&self, bytes: &[u8]) -> Result<ClusterStateBundle>;
}

#[derive(Serialize, Deserialize)]
struct BundleDocument {
    states: StatesDocument,
}

#[derive(Serialize, Deserialize)]
struct StatesDocument {
    baseline: String,
    spaces: BTreeMap<String, String>,
}

/// Bundle codec writing a `states.baseline` / `states.spaces.<name>`
/// document through a configurable compressor.
#[derive(Debug, Clone)]
pub struct BinaryBundleCodec {
    compressor: Compressor,
}

impl BinaryBundleCodec {
    pub fn new(compressor: Compressor) -> Self {
        Self { compressor }
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    fn to_document_bytes(bundle: &ClusterStateBundle) -> Result<Vec<u8>> {
        let document = BundleDocument {
            states: StatesDocument {
                baseline: bundle.baseline().to_string(),
                spaces: bundle
                    .derived()
                    .iter()
                    .map(|(space, state)| (space.clone(), state.to_string()))
                    .collect(),
            },
        };
        Ok(bincode::serialize(&document)?)
    }

    fn from_document_bytes(bytes: &[u8]) -> Result<ClusterStateBundle> {
        let document: BundleDocument = bincode::deserialize(bytes)?;
        let baseline = ClusterState::parse(&document.states.baseline)?;
        let mut derived = BTreeMap::new();
        for (space, text) in document.states.spaces {
            derived.insert(space, ClusterState::parse(&text)?);
        }
        ClusterStateBundle::new(baseline, derived)
    }
}

impl Default for BinaryBundleCodec {
    fn default() -> Self {
        Self::new(Compressor::snappy(CompressionConfig::default()))
    }
}

impl ClusterStateBundleCodec for BinaryBundleCodec {
    fn encode(&self, bundle: &ClusterStateBundle) -> Result<EncodedClusterStateBundle> {
        let document = Self::to_document_bytes(bundle)?;
        let compressed = self.compressor.compress(document)?;
        let uncompressed_length = i32::try_from(compressed.uncompressed_len).map_err(|_| {
            Error::Codec(format!(
                "bundle document of {} bytes exceeds the wire length field",
                compressed.uncompressed_len
            ))
        })?;
        Ok(EncodedClusterStateBundle {
            compression_type: compressed.compression_type,
            uncompressed_length,
            payload: compressed.data,
        })
    }

    fn decode(&self, encoded: &EncodedClusterStateBundle) -> Result<ClusterStateBundle> {
        let uncompressed_len = usize::try_from(encoded.uncompressed_length).map_err(|_| {
            Error::Codec(format!(
                "negative uncompressed length {}",
                encoded.uncompressed_length
            ))
        })?;
        let document = self.compressor.decompress(
            encoded.compression_type,
            uncompressed_len,
            &encoded.payload,
        )?;
        Self::from_document_bytes(&document)
    }
}

impl EnvelopedClusterStateBundleCodec for BinaryBundleCodec {
    fn encode_with_envelope(&self, bundle: &ClusterStateBundle) -> Result<Vec<u8>> {
        let encoded = self.encode(bundle)?;
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + encoded.payload.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.push(encoded.compression_type.code());
        out.extend_from_slice(&encoded.uncompressed_length.to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&encoded.payload).to_be_bytes());
        out.extend_from_slice(&encoded.payload);
        Ok(out)
    }

    fn decode_with_envelope(&self, bytes: &[u8]) -> Result<ClusterStateBundle> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::Codec(format!(
                "envelope is {} bytes, shorter than its {} byte header",
                bytes.len(),
                ENVELOPE_HEADER_LEN
            )));
        }
        if &bytes[0..4] != ENVELOPE_MAGIC {
            return Err(Error::Codec("envelope magic mismatch".to_string()));
        }
        if bytes[4] != ENVELOPE_VERSION {
            return Err(Error::Codec(format!(
                "unsupported envelope version {}",
                bytes[4]
            )));
        }
        let compression_type = CompressionType::from_code(bytes[5])?;
        let uncompressed_length = i32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let expected_crc = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        let payload = &bytes[ENVELOPE_HEADER_LEN..];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Err(Error::Codec(format!(
                "envelope checksum mismatch: expected {:08x}, got {:08x}",
                expected_crc, actual_crc
            )));
        }

        self.decode(&EncodedClusterStateBundle {
            compression_type,
            uncompressed_length,
            payload: payload.to_vec(),
        })
    }
}
