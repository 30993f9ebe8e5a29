//! # JSON <-> Protobuf Codec
//!
//! This module implements `tonic::codec::Codec` to enable `tonic` to transport `serde_json::Value`
//! directly, bypassing the need for generated Rust structs.
//!
//! ## How it works
//!
//! 1. **Encoder (JSON -> Proto)**:
//!    - Takes a `serde_json::Value`.
//!    - Uses `prost_reflect::DynamicMessage` to check the JSON against the input `MessageDescriptor`.
//!    - Serializes the message into the generic gRPC byte buffer.
//!
//! 2. **Decoder (Proto -> JSON)**:
//!    - Reads raw bytes from the wire.
//!    - Decodes them into a `DynamicMessage` using the output `MessageDescriptor`.
//!    - Converts the message back into a `serde_json::Value`.
//!
//! Both directions honour a [`PayloadBehavior`], which is the per-operation serialization
//! policy a proxy applies to its client instance.
use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// Serialization policy of a single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBehavior {
    /// Accept JSON fields (and enum names) the schema does not know about.
    pub ignore_unknown_fields: bool,
    /// Include fields holding their default value in decoded JSON.
    pub emit_default_values: bool,
    /// Upper bound for a single encoded message. `None` means unbounded.
    pub max_message_size: Option<usize>,
}

impl Default for PayloadBehavior {
    fn default() -> Self {
        Self {
            ignore_unknown_fields: false,
            emit_default_values: false,
            max_message_size: Some(4 * 1024 * 1024),
        }
    }
}

/// A custom Codec that bridges `serde_json::Value` and Protobuf binary format.
///
/// It holds the descriptors (schemas) for both the request and the response messages,
/// allowing it to perform dynamic serialization.
pub struct JsonCodec {
    req_desc: MessageDescriptor,
    res_desc: MessageDescriptor,
    behavior: PayloadBehavior,
}

impl JsonCodec {
    pub fn new(req_desc: MessageDescriptor, res_desc: MessageDescriptor) -> Self {
        Self::with_behavior(req_desc, res_desc, PayloadBehavior::default())
    }

    pub fn with_behavior(
        req_desc: MessageDescriptor,
        res_desc: MessageDescriptor,
        behavior: PayloadBehavior,
    ) -> Self {
        Self {
            req_desc,
            res_desc,
            behavior,
        }
    }
}

impl Codec for JsonCodec {
    type Encode = serde_json::Value;
    type Decode = serde_json::Value;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder {
            desc: self.req_desc.clone(),
            behavior: self.behavior.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder {
            desc: self.res_desc.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

/// Responsible for encoding a JSON value into Protobuf bytes.
pub struct JsonEncoder {
    desc: MessageDescriptor,
    behavior: PayloadBehavior,
}

impl Encoder for JsonEncoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let msg = json_to_message(self.desc.clone(), item, &self.behavior)?;

        if let Some(max) = self.behavior.max_message_size {
            let len = msg.encoded_len();
            if len > max {
                return Err(Status::resource_exhausted(format!(
                    "Encoded message of {len} bytes exceeds the limit of {max} bytes"
                )));
            }
        }

        msg.encode_raw(dst);
        Ok(())
    }
}

/// Responsible for decoding Protobuf bytes into a JSON value.
pub struct JsonDecoder {
    desc: MessageDescriptor,
    behavior: PayloadBehavior,
}

impl Decoder for JsonDecoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(max) = self.behavior.max_message_size {
            let len = prost::bytes::Buf::remaining(src);
            if len > max {
                return Err(Status::resource_exhausted(format!(
                    "Received message of {len} bytes exceeds the limit of {max} bytes"
                )));
            }
        }

        let mut msg = DynamicMessage::new(self.desc.clone());
        msg.merge(src)
            .map_err(|e| Status::internal(format!("Failed to decode Protobuf bytes: {}", e)))?;

        message_to_json(&msg, &self.behavior).map(Some)
    }
}

/// Transcodes JSON into a message of the given type.
pub fn json_to_message(
    desc: MessageDescriptor,
    value: serde_json::Value,
    behavior: &PayloadBehavior,
) -> Result<DynamicMessage, Status> {
    let options = DeserializeOptions::new().deny_unknown_fields(!behavior.ignore_unknown_fields);

    DynamicMessage::deserialize_with_options(desc, value, &options).map_err(|e| {
        Status::invalid_argument(format!(
            "JSON structure does not match Protobuf schema: {}",
            e
        ))
    })
}

/// Converts a message into its canonical JSON mapping.
pub fn message_to_json(
    msg: &DynamicMessage,
    behavior: &PayloadBehavior,
) -> Result<serde_json::Value, Status> {
    let options = SerializeOptions::new().skip_default_fields(!behavior.emit_default_values);

    msg.serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| Status::internal(format!("Failed to map response to JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;

    fn echo_request() -> MessageDescriptor {
        DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET)
            .unwrap()
            .get_message_by_name("echo.EchoRequest")
            .unwrap()
    }

    #[test]
    fn unknown_fields_follow_the_behavior() {
        let payload = serde_json::json!({ "message": "hi", "extra": 1 });

        let strict = PayloadBehavior::default();
        let err = json_to_message(echo_request(), payload.clone(), &strict).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let lenient = PayloadBehavior {
            ignore_unknown_fields: true,
            ..Default::default()
        };
        let msg = json_to_message(echo_request(), payload, &lenient).unwrap();
        assert_eq!(
            message_to_json(&msg, &lenient).unwrap(),
            serde_json::json!({ "message": "hi" })
        );
    }

    #[test]
    fn default_values_are_emitted_on_request() {
        let msg = DynamicMessage::new(echo_request());

        let skip = message_to_json(&msg, &PayloadBehavior::default()).unwrap();
        assert_eq!(skip, serde_json::json!({}));

        let emit = PayloadBehavior {
            emit_default_values: true,
            ..Default::default()
        };
        assert_eq!(
            message_to_json(&msg, &emit).unwrap(),
            serde_json::json!({ "message": "" })
        );
    }
}
