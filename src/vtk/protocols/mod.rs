//! Codec implementations and factory.

pub mod vendotek;

use super::protocol::Codec;
use crate::error::CodecError;

/// Create the codec for a given protocol name.
pub fn create_codec(protocol: &str, max_frame_len: usize) -> Result<Box<dyn Codec>, CodecError> {
    match protocol {
        "vendotek" | "vtk" => Ok(Box::new(vendotek::VendotekCodec::with_max_frame_len(
            max_frame_len,
        ))),
        other => Err(CodecError::UnsupportedProtocol(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_codec_vendotek() {
        let codec = create_codec("vendotek", 4096).unwrap();
        assert_eq!(codec.name(), "Vendotek");
    }

    #[test]
    fn test_create_codec_unknown() {
        assert_eq!(
            create_codec("zvt", 4096).err(),
            Some(CodecError::UnsupportedProtocol("zvt".into()))
        );
    }
}
