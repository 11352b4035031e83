//! Compressed wire encoding of cluster state bundles
//!
//! A bundle is serialized into a small binary document holding the text form
//! of the baseline state and of each derived state, then run through a block
//! compressor when that is worth it. The compression tag and uncompressed
//! length travel alongside the payload, either as separate RPC parameters or
//! inlined in an envelope.

mod bundle_codec;
mod compression;

pub use bundle_codec::{
    BinaryBundleCodec, ClusterStateBundleCodec, EncodedClusterStateBundle,
    EnvelopedClusterStateBundleCodec,
};
pub use compression::{
    BlockCompressor, Compressed, CompressionConfig, CompressionType, Compressor,
    SnappyCompressor,
};
