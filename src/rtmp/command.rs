// RTMP command

use crate::{
    amf::{AMF0Value, AMFDecodingCursor, AmfError},
    base::{StreamError, StreamResult},
};

use super::RTMP_TYPE_FLEX_MESSAGE;

/// RTMP command (AMF0 invoke)
#[derive(Clone, Debug, PartialEq)]
pub struct RtmpCommand {
    /// Command name
    pub name: String,

    /// Transaction id
    pub transaction_id: f64,

    /// Command object (null for most stream commands)
    pub command_object: AMF0Value,

    /// Remaining arguments, in order
    pub args: Vec<AMF0Value>,
}

impl RtmpCommand {
    /// Creates a new command
    pub fn new(name: &str, transaction_id: f64, command_object: AMF0Value) -> RtmpCommand {
        RtmpCommand {
            name: name.to_string(),
            transaction_id,
            command_object,
            args: Vec::new(),
        }
    }

    /// Adds an argument, builder style
    pub fn with_arg(mut self, arg: AMF0Value) -> RtmpCommand {
        self.args.push(arg);
        self
    }

    /// Gets an argument as string
    pub fn get_string_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(|a| a.get_string())
    }

    /// Encodes the command as an AMF0 payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        AMF0Value::string(&self.name).write_to(&mut buf);
        AMF0Value::number(self.transaction_id).write_to(&mut buf);
        self.command_object.write_to(&mut buf);

        for arg in &self.args {
            arg.write_to(&mut buf);
        }

        buf
    }

    /// Decodes a command message payload
    ///
    /// # Arguments
    ///
    /// * `payload` - Message payload
    /// * `msg_type_id` - Type of the message (17 payloads carry a leading format byte)
    pub fn decode(payload: &[u8], msg_type_id: u8) -> StreamResult<RtmpCommand> {
        let payload = if msg_type_id == RTMP_TYPE_FLEX_MESSAGE && !payload.is_empty() {
            &payload[1..]
        } else {
            payload
        };

        let mut cursor = AMFDecodingCursor::new(payload);

        let name = match AMF0Value::read(&mut cursor)? {
            AMF0Value::String { value } | AMF0Value::LongString { value } => value,
            _ => {
                return Err(StreamError::ProtocolViolation(
                    "command name is not a string".to_string(),
                ))
            }
        };

        let transaction_id = if cursor.ended() {
            0.0
        } else {
            AMF0Value::read(&mut cursor)?.get_float().unwrap_or(0.0)
        };

        let command_object = if cursor.ended() {
            AMF0Value::Null
        } else {
            AMF0Value::read(&mut cursor)?
        };

        let mut args = Vec::new();

        while !cursor.ended() {
            args.push(AMF0Value::read(&mut cursor).map_err(|e: AmfError| {
                StreamError::ProtocolViolation(format!("command {}: {}", name, e))
            })?);
        }

        Ok(RtmpCommand {
            name,
            transaction_id,
            command_object,
            args,
        })
    }
}

// Tests
