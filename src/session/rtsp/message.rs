// RTSP messages and interleaved frames

use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::{
    headers, Data, Message, ParseError, Request, Response, ResponseBuilder, StatusCode, Url,
};

use crate::base::{StreamError, StreamResult};

/// Max size of a buffered message (head and SDP body)
const RTSP_MAX_MESSAGE_SIZE: usize = 16384 + 65536;

pub type RtspRequest = Request<Vec<u8>>;
pub type RtspResponse = Response<Vec<u8>>;

/// Item read from an RTSP connection
#[derive(Clone, Debug)]
pub enum RtspItem {
    Request(RtspRequest),

    /// Responses are only expected by the client side
    Response(RtspResponse),

    Interleaved { channel: u8, data: Bytes },
}

/// Incremental reader of messages and interleaved frames
#[derive(Default)]
pub struct RtspReader {
    buffer: BytesMut,
}

impl RtspReader {
    pub fn new() -> RtspReader {
        RtspReader::default()
    }

    /// Feeds bytes, returning the completed items
    pub fn feed(&mut self, data: &[u8]) -> StreamResult<Vec<RtspItem>> {
        self.buffer.extend_from_slice(data);

        let mut items = Vec::new();

        while let Some(item) = self.next_item()? {
            items.push(item);
        }

        Ok(items)
    }

    fn next_item(&mut self) -> StreamResult<Option<RtspItem>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let (message, consumed) = match Message::<Vec<u8>>::parse(&self.buffer[..]) {
            Ok(r) => r,
            Err(ParseError::Incomplete(_)) => {
                if self.buffer.len() > RTSP_MAX_MESSAGE_SIZE {
                    return Err(StreamError::ProtocolViolation(
                        "RTSP message too large".to_string(),
                    ));
                }
                return Ok(None);
            }
            Err(_) => {
                return Err(StreamError::ProtocolViolation(
                    "invalid RTSP message".to_string(),
                ));
            }
        };

        self.buffer.advance(consumed);

        Ok(Some(match message {
            Message::Request(r) => RtspItem::Request(r),
            Message::Response(r) => RtspItem::Response(r),
            Message::Data(d) => RtspItem::Interleaved {
                channel: d.channel_id(),
                data: Bytes::from(d.into_body()),
            },
        }))
    }
}

/// CSeq of a request, "0" if missing
pub fn request_cseq(request: &RtspRequest) -> &str {
    request
        .header(&headers::CSEQ)
        .map(|v| v.as_str())
        .unwrap_or("0")
}

/// Starts a response to a request, echoing its CSeq
pub fn response_to(request: &RtspRequest, status: StatusCode) -> ResponseBuilder {
    Response::builder(request.version(), status)
        .header(headers::CSEQ, request_cseq(request))
        .header(headers::SERVER, env!("CARGO_PKG_NAME"))
}

/// Builds a response with an empty body
pub fn empty_response(builder: ResponseBuilder) -> RtspResponse {
    builder.build(Vec::new())
}

/// Builds a response carrying a body
pub fn body_response(builder: ResponseBuilder, content_type: &str, body: Vec<u8>) -> RtspResponse {
    builder
        .header(headers::CONTENT_TYPE, content_type)
        .header(headers::CONTENT_LENGTH, body.len().to_string())
        .build(body)
}

/// Serializes a response
pub fn encode_response(response: RtspResponse) -> StreamResult<Bytes> {
    let mut out = Vec::new();

    Message::Response(response)
        .write(&mut out)
        .map_err(|e| {
            StreamError::ProtocolViolation(format!("could not write response: {:?}", e))
        })?;

    Ok(Bytes::from(out))
}

/// Frames a packet for interleaved transport
pub fn encode_interleaved(channel: u8, data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + data.len());

    // Only frames over 64 KiB are rejected, RTP packets are smaller
    let _ = Message::Data(Data::new(channel, data)).write(&mut out);

    Bytes::from(out)
}

/// Transport requested by SETUP
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtspTransport {
    /// RTP and RTCP over the RTSP connection
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },

    /// RTP and RTCP over UDP, ports of the client
    Udp { rtp_port: u16, rtcp_port: u16 },
}

impl RtspTransport {
    /// Parses the Transport header. The first supported entry wins.
    pub fn parse(header: &str) -> StreamResult<RtspTransport> {
        for entry in header.split(',') {
            let mut fields = entry.split(';').map(|f| f.trim());

            let protocol = fields.next().unwrap_or("").to_ascii_uppercase();
            let params: Vec<&str> = fields.collect();

            let param = |name: &str| {
                params.iter().find_map(|p| {
                    p.split_once('=')
                        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                        .map(|(_, v)| v)
                })
            };

            if protocol == "RTP/AVP/TCP" {
                let (rtp_channel, rtcp_channel) = match param("interleaved") {
                    Some(v) => parse_pair::<u8>(v)?,
                    None => (0, 1),
                };

                return Ok(RtspTransport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                });
            }

            if protocol == "RTP/AVP" || protocol == "RTP/AVP/UDP" {
                if let Some(v) = param("client_port") {
                    let (rtp_port, rtcp_port) = parse_pair::<u16>(v)?;
                    return Ok(RtspTransport::Udp { rtp_port, rtcp_port });
                }
            }
        }

        Err(StreamError::ProtocolViolation(format!(
            "unsupported transport: {}",
            header
        )))
    }

    /// Parses the Transport header of a request
    pub fn from_request(request: &RtspRequest) -> StreamResult<RtspTransport> {
        match request.header(&headers::TRANSPORT) {
            Some(v) => RtspTransport::parse(v.as_str()),
            None => Err(StreamError::ProtocolViolation(
                "missing Transport header".to_string(),
            )),
        }
    }
}

/// Parses "a-b" or "a", the second value defaults to a + 1
fn parse_pair<T>(v: &str) -> StreamResult<(T, T)>
where
    T: std::str::FromStr + Copy + std::ops::Add<Output = T> + From<u8>,
{
    let invalid = || StreamError::ProtocolViolation(format!("invalid port pair: {}", v));

    match v.split_once('-') {
        Some((a, b)) => Ok((
            a.trim().parse().map_err(|_| invalid())?,
            b.trim().parse().map_err(|_| invalid())?,
        )),
        None => {
            let a: T = v.trim().parse().map_err(|_| invalid())?;
            Ok((a, a + T::from(1)))
        }
    }
}

/// Splits `rtsp://host/app/stream?query` into (app, stream, query)
pub fn parse_stream_uri(uri: &Url) -> Option<(String, String, String)> {
    let path = uri.path().trim_matches('/');
    let (app, stream) = path.rsplit_once('/')?;

    if app.is_empty() || stream.is_empty() {
        return None;
    }

    Some((
        app.to_string(),
        stream.to_string(),
        uri.query().unwrap_or("").to_string(),
    ))
}

// Tests
