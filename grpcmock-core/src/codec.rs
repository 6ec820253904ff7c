use bytes::{Buf, BufMut, Bytes};
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Wire name of the codec, advertised as the gRPC content-type subtype on
/// dispatcher responses.
pub const CODEC_NAME: &str = "multiplex";

/// The codec operand: either an opaque wire frame or a typed message.
///
/// The proxy path moves `Raw` frames without parsing; the mock path works
/// with `Message` values decoded against runtime-resolved descriptors. The
/// tag tells the encoder which strategy to use without inspecting the
/// destination type.
#[derive(Debug, Clone)]
pub enum Frame {
    Raw(Bytes),
    Message(DynamicMessage),
}

enum DecodeMode {
    /// Yield frames verbatim, without parsing.
    Opaque,
    /// Decode each frame as a `DynamicMessage` of the given type.
    Typed(MessageDescriptor),
}

/// A gRPC codec that passes raw frames through untouched and falls back to
/// protobuf encoding for typed messages.
///
/// Unlike tonic's ProstCodec which works with compile-time generated types,
/// the typed path works with runtime-resolved message descriptors, so a
/// single server-wide codec serves both mock and proxy traffic.
pub struct MultiplexCodec {
    decode: DecodeMode,
}

impl MultiplexCodec {
    /// Codec for opaque byte-level forwarding (the proxy path).
    pub fn opaque() -> Self {
        MultiplexCodec {
            decode: DecodeMode::Opaque,
        }
    }

    /// Codec that decodes incoming frames against `descriptor`: the request
    /// type on the server side, the response type on the client side.
    pub fn typed(descriptor: MessageDescriptor) -> Self {
        MultiplexCodec {
            decode: DecodeMode::Typed(descriptor),
        }
    }
}

impl Codec for MultiplexCodec {
    type Encode = Frame;
    type Decode = Frame;
    type Encoder = MultiplexEncoder;
    type Decoder = MultiplexDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        MultiplexEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        MultiplexDecoder {
            mode: match &self.decode {
                DecodeMode::Opaque => DecodeMode::Opaque,
                DecodeMode::Typed(desc) => DecodeMode::Typed(desc.clone()),
            },
        }
    }
}

pub struct MultiplexEncoder;

impl Encoder for MultiplexEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Frame::Raw(bytes) => {
                dst.put(bytes);
                Ok(())
            }
            Frame::Message(msg) => msg
                .encode(dst)
                .map_err(|e| Status::internal(format!("failed to encode message: {e}"))),
        }
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct MultiplexDecoder {
    mode: DecodeMode,
}

impl Decoder for MultiplexDecoder {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        match &self.mode {
            DecodeMode::Opaque => {
                let len = src.remaining();
                Ok(Some(Frame::Raw(src.copy_to_bytes(len))))
            }
            DecodeMode::Typed(desc) => {
                let msg = DynamicMessage::decode(desc.clone(), src)
                    .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
                Ok(Some(Frame::Message(msg)))
            }
        }
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
