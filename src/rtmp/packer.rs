// RTMP message builders

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use crate::{
    amf::AMF0Value,
    base::{AvMsg, AvMsgHeader},
};

use super::{
    RtmpCommand, RTMP_CSID_AMF, RTMP_CSID_OVER_CONNECTION, RTMP_CSID_OVER_STREAM,
    RTMP_CSID_PROTOCOL_CONTROL, RTMP_EVENT_STREAM_BEGIN, RTMP_MSID_MEDIA,
    RTMP_TYPE_ACKNOWLEDGEMENT, RTMP_TYPE_DATA, RTMP_TYPE_EVENT, RTMP_TYPE_INVOKE,
    RTMP_TYPE_SET_CHUNK_SIZE, RTMP_TYPE_SET_PEER_BANDWIDTH, RTMP_TYPE_WINDOW_ACKNOWLEDGEMENT_SIZE,
};

/// Flash version announced by client sessions
pub const RTMP_CLIENT_FLASH_VER: &str = "LNX 9,0,124,2";

/// Server version announced in the connect result
pub const RTMP_SERVER_FMS_VER: &str = "FMS/3,0,1,123";

fn make_message(csid: u32, msg_type_id: u8, msg_stream_id: u32, payload: Vec<u8>) -> AvMsg {
    AvMsg {
        header: AvMsgHeader {
            csid,
            msg_len: payload.len() as u32,
            msg_type_id,
            msg_stream_id,
            timestamp_abs: 0,
        },
        payload: Bytes::from(payload),
    }
}

fn make_control_u32(msg_type_id: u8, value: u32) -> AvMsg {
    let mut b = vec![0u8; 4];
    BigEndian::write_u32(&mut b, value);
    make_message(RTMP_CSID_PROTOCOL_CONTROL, msg_type_id, 0, b)
}

/// Makes a SetChunkSize message
pub fn pack_set_chunk_size(size: u32) -> AvMsg {
    make_control_u32(RTMP_TYPE_SET_CHUNK_SIZE, size)
}

/// Makes a WindowAcknowledgementSize message
pub fn pack_window_ack_size(size: u32) -> AvMsg {
    make_control_u32(RTMP_TYPE_WINDOW_ACKNOWLEDGEMENT_SIZE, size)
}

/// Makes an Acknowledgement message
///
/// # Arguments
///
/// * `sequence_number` - Total bytes received so far
pub fn pack_acknowledgement(sequence_number: u32) -> AvMsg {
    make_control_u32(RTMP_TYPE_ACKNOWLEDGEMENT, sequence_number)
}

/// Makes a SetPeerBandwidth message
pub fn pack_peer_bandwidth(size: u32, limit_type: u8) -> AvMsg {
    let mut b = vec![0u8; 5];
    BigEndian::write_u32(&mut b[0..4], size);
    b[4] = limit_type;
    make_message(RTMP_CSID_PROTOCOL_CONTROL, RTMP_TYPE_SET_PEER_BANDWIDTH, 0, b)
}

/// Makes a user control StreamBegin event
pub fn pack_stream_begin(stream_id: u32) -> AvMsg {
    let mut b = vec![0u8; 6];
    BigEndian::write_u16(&mut b[0..2], RTMP_EVENT_STREAM_BEGIN);
    BigEndian::write_u32(&mut b[2..6], stream_id);
    make_message(RTMP_CSID_PROTOCOL_CONTROL, RTMP_TYPE_EVENT, 0, b)
}

/// Makes an invoke message carrying a command
pub fn pack_command(cmd: &RtmpCommand, csid: u32, msg_stream_id: u32) -> AvMsg {
    make_message(csid, RTMP_TYPE_INVOKE, msg_stream_id, cmd.encode())
}

fn props(pairs: Vec<(&str, AMF0Value)>) -> AMF0Value {
    AMF0Value::Object {
        properties: pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    }
}

/// Makes the connect command of a client session
///
/// # Arguments
///
/// * `app` - Application name
/// * `tc_url` - Target URL, without the stream name
/// * `publishing` - True for push sessions
pub fn pack_connect(app: &str, tc_url: &str, publishing: bool) -> AvMsg {
    let mut pairs = vec![
        ("app", AMF0Value::string(app)),
        ("type", AMF0Value::string("nonprivate")),
        ("flashVer", AMF0Value::string(RTMP_CLIENT_FLASH_VER)),
        ("tcUrl", AMF0Value::string(tc_url)),
    ];

    if !publishing {
        pairs.push(("fpad", AMF0Value::Bool { value: false }));
        pairs.push(("capabilities", AMF0Value::number(15.0)));
        pairs.push(("audioCodecs", AMF0Value::number(3191.0)));
        pairs.push(("videoCodecs", AMF0Value::number(252.0)));
        pairs.push(("videoFunction", AMF0Value::number(1.0)));
    }

    let cmd = RtmpCommand::new("connect", 1.0, props(pairs));

    pack_command(&cmd, RTMP_CSID_OVER_CONNECTION, 0)
}

/// Makes the result of a connect command
///
/// # Arguments
///
/// * `transaction_id` - Transaction id of the request
/// * `object_encoding` - Object encoding requested by the client, if any
pub fn pack_connect_result(transaction_id: f64, object_encoding: Option<f64>) -> AvMsg {
    let cmd = RtmpCommand::new(
        "_result",
        transaction_id,
        props(vec![
            ("fmsVer", AMF0Value::string(RTMP_SERVER_FMS_VER)),
            ("capabilities", AMF0Value::number(31.0)),
        ]),
    )
    .with_arg(props(vec![
        ("level", AMF0Value::string("status")),
        ("code", AMF0Value::string("NetConnection.Connect.Success")),
        ("description", AMF0Value::string("Connection succeeded.")),
        (
            "objectEncoding",
            AMF0Value::number(object_encoding.unwrap_or(0.0)),
        ),
    ]));

    pack_command(&cmd, RTMP_CSID_OVER_CONNECTION, 0)
}

/// Makes the createStream command of a client session
pub fn pack_create_stream(transaction_id: f64) -> AvMsg {
    let cmd = RtmpCommand::new("createStream", transaction_id, AMF0Value::Null);
    pack_command(&cmd, RTMP_CSID_OVER_CONNECTION, 0)
}

/// Makes the result of a createStream command
pub fn pack_create_stream_result(transaction_id: f64, stream_id: u32) -> AvMsg {
    let cmd = RtmpCommand::new("_result", transaction_id, AMF0Value::Null)
        .with_arg(AMF0Value::number(stream_id as f64));
    pack_command(&cmd, RTMP_CSID_OVER_CONNECTION, 0)
}

/// Makes the publish command of a client session
pub fn pack_publish(stream_name: &str, stream_id: u32) -> AvMsg {
    let cmd = RtmpCommand::new("publish", 0.0, AMF0Value::Null)
        .with_arg(AMF0Value::string(stream_name))
        .with_arg(AMF0Value::string("live"));
    pack_command(&cmd, RTMP_CSID_OVER_STREAM, stream_id)
}

/// Makes the play command of a client session
pub fn pack_play(stream_name: &str, stream_id: u32) -> AvMsg {
    let cmd = RtmpCommand::new("play", 0.0, AMF0Value::Null)
        .with_arg(AMF0Value::string(stream_name))
        .with_arg(AMF0Value::number(-2000.0));
    pack_command(&cmd, RTMP_CSID_OVER_STREAM, stream_id)
}

/// Makes an onStatus message
///
/// # Arguments
///
/// * `level` - "status" or "error"
/// * `code` - Status code, e.g. NetStream.Publish.Start
/// * `description` - Human readable description
pub fn pack_on_status(level: &str, code: &str, description: &str) -> AvMsg {
    let cmd = RtmpCommand::new("onStatus", 0.0, AMF0Value::Null).with_arg(props(vec![
        ("level", AMF0Value::string(level)),
        ("code", AMF0Value::string(code)),
        ("description", AMF0Value::string(description)),
    ]));
    pack_command(&cmd, RTMP_CSID_OVER_STREAM, RTMP_MSID_MEDIA)
}

pub fn pack_on_status_publish_start() -> AvMsg {
    pack_on_status("status", "NetStream.Publish.Start", "Start publishing")
}

pub fn pack_on_status_play_start() -> AvMsg {
    pack_on_status("status", "NetStream.Play.Start", "Start live")
}

/// Makes the error status sent before closing a refused session
pub fn pack_on_status_error(code: &str, description: &str) -> AvMsg {
    pack_on_status("error", code, description)
}

/// Makes the |RtmpSampleAccess data message sent to players
pub fn pack_sample_access() -> AvMsg {
    let mut buf = Vec::new();
    AMF0Value::string("|RtmpSampleAccess").write_to(&mut buf);
    AMF0Value::Bool { value: true }.write_to(&mut buf);
    AMF0Value::Bool { value: true }.write_to(&mut buf);
    make_message(RTMP_CSID_AMF, RTMP_TYPE_DATA, RTMP_MSID_MEDIA, buf)
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_control_messages() {
        let m = pack_set_chunk_size(4096);
        assert_eq!(m.header.csid, RTMP_CSID_PROTOCOL_CONTROL);
        assert_eq!(m.header.msg_type_id, RTMP_TYPE_SET_CHUNK_SIZE);
        assert_eq!(m.payload.as_ref(), &[0x00, 0x00, 0x10, 0x00]);

        let m = pack_peer_bandwidth(5_000_000, 2);
        assert_eq!(m.header.msg_len, 5);
        assert_eq!(m.payload[4], 2);

        let m = pack_stream_begin(1);
        assert_eq!(m.payload.as_ref(), &[0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_pack_connect_result_echoes_transaction() {
        let m = pack_connect_result(7.0, Some(3.0));
        let cmd = RtmpCommand::decode(&m.payload, m.header.msg_type_id).unwrap();

        assert_eq!(cmd.name, "_result");
        assert_eq!(cmd.transaction_id, 7.0);
        assert_eq!(
            cmd.command_object
                .get_property("fmsVer")
                .and_then(|v| v.get_string()),
            Some(RTMP_SERVER_FMS_VER)
        );
        assert_eq!(
            cmd.args[0]
                .get_property("objectEncoding")
                .and_then(|v| v.get_float()),
            Some(3.0)
        );
    }

    #[test]
    fn test_pack_connect_keeps_pair_order() {
        let m = pack_connect("live", "rtmp://127.0.0.1:1935/live", true);
        let cmd = RtmpCommand::decode(&m.payload, m.header.msg_type_id).unwrap();

        let keys: Vec<&str> = cmd
            .command_object
            .get_properties()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();

        assert_eq!(keys, vec!["app", "type", "flashVer", "tcUrl"]);
    }

    #[test]
    fn test_pack_on_status_error() {
        let m = pack_on_status_error("NetStream.Publish.BadName", "Stream already publishing");
        let cmd = RtmpCommand::decode(&m.payload, m.header.msg_type_id).unwrap();

        assert_eq!(m.header.msg_stream_id, RTMP_MSID_MEDIA);
        assert_eq!(
            cmd.args[0].get_property("level").and_then(|v| v.get_string()),
            Some("error")
        );
        assert_eq!(
            cmd.args[0].get_property("code").and_then(|v| v.get_string()),
            Some("NetStream.Publish.BadName")
        );
    }
}
