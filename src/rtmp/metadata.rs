// Stream metadata (onMetaData)

use bytes::Bytes;

use crate::{
    amf::{AMF0Value, AMFDecodingCursor, ObjectPairArray},
    base::{StreamError, StreamResult},
};

/// Version string written into built metadata
pub const METADATA_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Removes the @setDataFrame wrapper publishers put before onMetaData
///
/// Payloads without the wrapper are returned unchanged.
pub fn strip_set_data_frame(payload: &Bytes) -> StreamResult<Bytes> {
    let mut cursor = AMFDecodingCursor::new(payload);

    let first = AMF0Value::read(&mut cursor)?;

    if first.get_string() == Some("@setDataFrame") {
        Ok(payload.slice(cursor.position()..))
    } else {
        Ok(payload.clone())
    }
}

/// Parses an onMetaData payload, returning its properties
pub fn parse_metadata(payload: &[u8]) -> StreamResult<ObjectPairArray> {
    let values = AMF0Value::decode_all(payload)?;

    let mut iter = values.into_iter();

    let mut first = iter.next();

    if first.as_ref().and_then(|v| v.get_string()) == Some("@setDataFrame") {
        first = iter.next();
    }

    if first.as_ref().and_then(|v| v.get_string()) != Some("onMetaData") {
        return Err(StreamError::MalformedMedia(
            "metadata does not start with onMetaData".to_string(),
        ));
    }

    match iter.next() {
        Some(AMF0Value::EcmaArray { items }) => Ok(items),
        Some(AMF0Value::Object { properties }) => Ok(properties),
        _ => Ok(Vec::new()),
    }
}

/// Builds an onMetaData payload
///
/// # Arguments
///
/// * `width` - Video width
/// * `height` - Video height
/// * `audiocodecid` - FLV sound format (10 for AAC)
/// * `videocodecid` - FLV video codec id (7 for AVC, 12 for HEVC)
pub fn build_metadata(width: u32, height: u32, audiocodecid: u8, videocodecid: u8) -> Vec<u8> {
    let items: ObjectPairArray = vec![
        ("width".to_string(), AMF0Value::number(width as f64)),
        ("height".to_string(), AMF0Value::number(height as f64)),
        (
            "audiocodecid".to_string(),
            AMF0Value::number(audiocodecid as f64),
        ),
        (
            "videocodecid".to_string(),
            AMF0Value::number(videocodecid as f64),
        ),
        ("version".to_string(), AMF0Value::string(METADATA_VERSION)),
    ];

    let mut buf = Vec::new();
    AMF0Value::string("onMetaData").write_to(&mut buf);
    AMF0Value::EcmaArray { items }.write_to(&mut buf);
    buf
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_build_parse_fields() {
        let payload = build_metadata(1280, 720, 10, 7);
        let items = parse_metadata(&payload).unwrap();

        let keys: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["width", "height", "audiocodecid", "videocodecid", "version"]
        );
        assert_eq!(items[0].1.get_float(), Some(1280.0));
        assert_eq!(items[1].1.get_float(), Some(720.0));
        assert_eq!(items[3].1.get_float(), Some(7.0));
        assert_eq!(items[4].1.get_string(), Some(METADATA_VERSION));
    }

    #[test]
    fn test_metadata_strip_set_data_frame() {
        let inner = build_metadata(640, 360, 10, 12);

        let mut wrapped = Vec::new();
        AMF0Value::string("@setDataFrame").write_to(&mut wrapped);
        wrapped.extend_from_slice(&inner);

        let stripped = strip_set_data_frame(&Bytes::from(wrapped.clone())).unwrap();
        assert_eq!(stripped.as_ref(), &inner[..]);

        let untouched = strip_set_data_frame(&Bytes::from(inner.clone())).unwrap();
        assert_eq!(untouched.as_ref(), &inner[..]);

        assert_eq!(parse_metadata(&wrapped).unwrap().len(), 5);
    }
}
