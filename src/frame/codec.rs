//! `tokio_util::codec` glue for [`Frame`](super::Frame), so a transport can
//! be driven through [`tokio_util::codec::Framed`] over any duplex stream.

use std::io::{Error as IoError, ErrorKind};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{get_bit, parse_opcode, parse_payload_len, Frame, OpCode};

/// encodes outgoing [`Frame`]s onto the wire
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {}

impl Encoder<Frame> for FrameEncoder {
    type Error = IoError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// decodes incoming bytes into [`Frame`]s, reassembling continuation frames
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    fragmented: bool,
    fragmented_type: Option<OpCode>,
    fragmented_data: BytesMut,
}

impl FrameDecoder {
    fn decode_single(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, IoError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let opcode = parse_opcode(src[0])
            .map_err(|code| IoError::new(ErrorKind::InvalidData, format!("unknown opcode {code}")))?;
        let (payload_len, len_occ) =
            parse_payload_len(src).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        let masked = get_bit(src, 1, 0);
        let mask_len = if masked { 4 } else { 0 };
        let header_len = 1 + len_occ + mask_len;
        let total_len = header_len + payload_len as usize;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }
        let fin = get_bit(src, 0, 0);
        let mask = if masked {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&src[header_len - 4..header_len]);
            Some(arr)
        } else {
            None
        };
        let payload = src[header_len..total_len].to_vec();
        src.advance(total_len);
        let frame = match mask {
            Some(mask) => {
                let mut f = Frame::new_masked(opcode, mask, &payload);
                f.set_fin(fin);
                f
            }
            None => {
                let mut f = Frame::new(opcode, &payload);
                f.set_fin(fin);
                f
            }
        };
        Ok(Some(frame))
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = IoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let frame = match self.decode_single(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame.opcode() {
                OpCode::Continue => {
                    if !self.fragmented {
                        return Err(IoError::new(
                            ErrorKind::InvalidData,
                            "continuation frame without an initial fragmented frame",
                        ));
                    }
                    self.fragmented_data.extend_from_slice(&frame.payload());
                    if frame.fin() {
                        self.fragmented = false;
                        let opcode = self.fragmented_type.take().unwrap_or(OpCode::Text);
                        let data = self.fragmented_data.split();
                        return Ok(Some(Frame::new(opcode, &data)));
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if !frame.fin() {
                        self.fragmented = true;
                        self.fragmented_type = Some(frame.opcode());
                        self.fragmented_data.clear();
                        self.fragmented_data.extend_from_slice(&frame.payload());
                    } else {
                        return Ok(Some(frame));
                    }
                }
                OpCode::Close | OpCode::Ping | OpCode::Pong => {
                    return Ok(Some(frame));
                }
            }
        }
    }
}
