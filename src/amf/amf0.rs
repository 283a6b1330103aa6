// AMF0 value

use byteorder::{BigEndian, ByteOrder};

use super::{AMFDecodingCursor, AmfError};

const AMF0_TYPE_NUMBER: u8 = 0x00;
const AMF0_TYPE_BOOL: u8 = 0x01;
const AMF0_TYPE_STRING: u8 = 0x02;
const AMF0_TYPE_OBJECT: u8 = 0x03;
const AMF0_TYPE_NULL: u8 = 0x05;
const AMF0_TYPE_UNDEFINED: u8 = 0x06;
const AMF0_TYPE_ECMA_ARRAY: u8 = 0x08;
const AMF0_TYPE_OBJECT_END: u8 = 0x09;
const AMF0_TYPE_STRICT_ARRAY: u8 = 0x0A;
const AMF0_TYPE_DATE: u8 = 0x0B;
const AMF0_TYPE_LONG_STRING: u8 = 0x0C;
const AMF0_TYPE_XML_DOC: u8 = 0x0F;
const AMF0_TYPE_TYPED_OBJ: u8 = 0x10;

/// Properties of an object, in wire order
pub type ObjectPairArray = Vec<(String, AMF0Value)>;

/// AMF0 compatible value
#[derive(Clone, Debug, PartialEq)]
pub enum AMF0Value {
    Number { value: f64 },
    Bool { value: bool },
    String { value: String },
    Object { properties: ObjectPairArray },
    Null,
    Undefined,
    EcmaArray { items: ObjectPairArray },
    StrictArray { items: Vec<AMF0Value> },
    Date { timestamp: f64 },
    LongString { value: String },
}

impl AMF0Value {
    /// Shorthand for string values
    pub fn string(value: &str) -> AMF0Value {
        AMF0Value::String {
            value: value.to_string(),
        }
    }

    /// Shorthand for number values
    pub fn number(value: f64) -> AMF0Value {
        AMF0Value::Number { value }
    }

    // Value check functions:

    pub fn is_null(&self) -> bool {
        matches!(self, AMF0Value::Null | AMF0Value::Undefined)
    }

    /// Returns the value as float
    pub fn get_float(&self) -> Option<f64> {
        match self {
            AMF0Value::Number { value } => Some(*value),
            AMF0Value::Date { timestamp } => Some(*timestamp),
            _ => None,
        }
    }

    /// Returns the value as string
    pub fn get_string(&self) -> Option<&str> {
        match self {
            AMF0Value::String { value } | AMF0Value::LongString { value } => Some(value),
            _ => None,
        }
    }

    /// Returns the value as boolean
    pub fn get_bool(&self) -> Option<bool> {
        match self {
            AMF0Value::Bool { value } => Some(*value),
            _ => None,
        }
    }

    /// Returns the properties of an object or ECMA array
    pub fn get_properties(&self) -> Option<&ObjectPairArray> {
        match self {
            AMF0Value::Object { properties } => Some(properties),
            AMF0Value::EcmaArray { items } => Some(items),
            _ => None,
        }
    }

    /// Gets the value of a property (for objects)
    pub fn get_property(&self, name: &str) -> Option<&AMF0Value> {
        self.get_properties()?
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    // Encoding functions:

    /// Encodes value into bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Encodes value, appending it to a buffer
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            AMF0Value::Number { value } => {
                buf.push(AMF0_TYPE_NUMBER);
                write_number(buf, *value);
            }
            AMF0Value::Bool { value } => {
                buf.push(AMF0_TYPE_BOOL);
                buf.push(if *value { 0x01 } else { 0x00 });
            }
            AMF0Value::String { value } => {
                if value.len() > 0xffff {
                    buf.push(AMF0_TYPE_LONG_STRING);
                    write_long_string(buf, value);
                } else {
                    buf.push(AMF0_TYPE_STRING);
                    write_short_string(buf, value);
                }
            }
            AMF0Value::Object { properties } => {
                buf.push(AMF0_TYPE_OBJECT);
                write_properties(buf, properties);
            }
            AMF0Value::Null => buf.push(AMF0_TYPE_NULL),
            AMF0Value::Undefined => buf.push(AMF0_TYPE_UNDEFINED),
            AMF0Value::EcmaArray { items } => {
                buf.push(AMF0_TYPE_ECMA_ARRAY);
                let mut count = [0u8; 4];
                BigEndian::write_u32(&mut count, items.len() as u32);
                buf.extend_from_slice(&count);
                write_properties(buf, items);
            }
            AMF0Value::StrictArray { items } => {
                buf.push(AMF0_TYPE_STRICT_ARRAY);
                let mut count = [0u8; 4];
                BigEndian::write_u32(&mut count, items.len() as u32);
                buf.extend_from_slice(&count);
                for item in items {
                    item.write_to(buf);
                }
            }
            AMF0Value::Date { timestamp } => {
                buf.push(AMF0_TYPE_DATE);
                write_number(buf, *timestamp);
                buf.extend_from_slice(&[0x00, 0x00]);
            }
            AMF0Value::LongString { value } => {
                buf.push(AMF0_TYPE_LONG_STRING);
                write_long_string(buf, value);
            }
        }
    }

    // Decoding functions:

    /// Reads one value from the cursor
    pub fn read(cursor: &mut AMFDecodingCursor) -> Result<AMF0Value, AmfError> {
        let marker = cursor.read_byte()?;

        match marker {
            AMF0_TYPE_NUMBER => Ok(AMF0Value::Number {
                value: cursor.read_f64()?,
            }),
            AMF0_TYPE_BOOL => Ok(AMF0Value::Bool {
                value: cursor.read_byte()? != 0,
            }),
            AMF0_TYPE_STRING => {
                let len = cursor.read_u16()? as usize;
                Ok(AMF0Value::String {
                    value: cursor.read_utf8(len)?,
                })
            }
            AMF0_TYPE_OBJECT => Ok(AMF0Value::Object {
                properties: read_properties(cursor)?,
            }),
            AMF0_TYPE_NULL => Ok(AMF0Value::Null),
            AMF0_TYPE_UNDEFINED => Ok(AMF0Value::Undefined),
            AMF0_TYPE_ECMA_ARRAY => {
                // The count is advisory, the terminator ends the array
                cursor.skip(4)?;
                Ok(AMF0Value::EcmaArray {
                    items: read_properties(cursor)?,
                })
            }
            AMF0_TYPE_STRICT_ARRAY => {
                let count = cursor.read_u32()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(AMF0Value::read(cursor)?);
                }
                Ok(AMF0Value::StrictArray { items })
            }
            AMF0_TYPE_DATE => {
                let timestamp = cursor.read_f64()?;
                cursor.skip(2)?;
                Ok(AMF0Value::Date { timestamp })
            }
            AMF0_TYPE_LONG_STRING | AMF0_TYPE_XML_DOC => {
                let len = cursor.read_u32()? as usize;
                Ok(AMF0Value::LongString {
                    value: cursor.read_utf8(len)?,
                })
            }
            AMF0_TYPE_TYPED_OBJ => {
                let len = cursor.read_u16()? as usize;
                cursor.skip(len)?;
                Ok(AMF0Value::Object {
                    properties: read_properties(cursor)?,
                })
            }
            _ => Err(AmfError::UnsupportedMarker(marker)),
        }
    }

    /// Decodes every value in a buffer
    pub fn decode_all(buffer: &[u8]) -> Result<Vec<AMF0Value>, AmfError> {
        let mut cursor = AMFDecodingCursor::new(buffer);
        let mut values = Vec::new();

        while !cursor.ended() {
            values.push(AMF0Value::read(&mut cursor)?);
        }

        Ok(values)
    }
}

fn write_number(buf: &mut Vec<u8>, num: f64) {
    let mut b = [0u8; 8];
    BigEndian::write_f64(&mut b, num);
    buf.extend_from_slice(&b);
}

fn write_short_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, s.len() as u16);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(s.as_bytes());
}

fn write_long_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, s.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(s.as_bytes());
}

fn write_properties(buf: &mut Vec<u8>, properties: &ObjectPairArray) {
    for (key, value) in properties {
        write_short_string(buf, key);
        value.write_to(buf);
    }

    buf.extend_from_slice(&[0x00, 0x00, AMF0_TYPE_OBJECT_END]);
}

fn read_properties(cursor: &mut AMFDecodingCursor) -> Result<ObjectPairArray, AmfError> {
    let mut properties = Vec::new();

    loop {
        let key_len = cursor.read_u16()? as usize;

        if key_len == 0 && cursor.look_byte()? == AMF0_TYPE_OBJECT_END {
            cursor.skip(1)?;
            return Ok(properties);
        }

        let key = cursor.read_utf8(key_len)?;
        let value = AMF0Value::read(cursor)?;

        properties.push((key, value));
    }
}

// Tests
