/// Lobby frame codec.
///
/// Frames a byte stream into [`Packet`]s: a 16-bit big-endian total length
/// (covering the 2-byte header itself) followed by NUL-terminated UTF-8
/// fields. The decoder buffers partial input, so a packet split across
/// reads, several packets in one read, and a lone incomplete header all
/// come out right.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::Packet;

/// Wire length of the frame header.
const HEADER_LEN: usize = 2;

/// Smallest legal frame: header plus one empty field's NUL.
const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Largest encodable frame; the 16-bit length field caps it anyway.
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Codec error: a malformed frame or an I/O error.
///
/// Every variant is fatal for the connection; framing faults get no
/// diagnostic reply.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame declares illegal length {0} (minimum {MIN_FRAME_LEN})")]
    BadLength(usize),
    #[error("frame payload is not NUL-terminated")]
    MissingTerminator,
    #[error("packet of {0} bytes exceeds the 16-bit length field")]
    PacketTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec framing lobby packets on length-prefix boundaries.
#[derive(Debug, Default)]
pub struct LobbyCodec;

impl Decoder for LobbyCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([src[0], src[1]]) as usize;
        if declared < MIN_FRAME_LEN {
            return Err(CodecError::BadLength(declared));
        }
        if src.len() < declared {
            // Incomplete frame; wait for more bytes.
            src.reserve(declared - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(declared);
        frame.advance(HEADER_LEN);

        if frame.last() != Some(&0) {
            return Err(CodecError::MissingTerminator);
        }
        let payload = std::str::from_utf8(&frame[..frame.len() - 1])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let fields = payload.split('\0').map(str::to_owned).collect();
        Ok(Some(Packet::from_fields(fields)))
    }
}

impl Encoder<Packet> for LobbyCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len: usize = item.fields().iter().map(|f| f.len() + 1).sum();
        let total = HEADER_LEN + payload_len;
        if total > MAX_FRAME_LEN {
            return Err(CodecError::PacketTooLarge(total));
        }

        dst.reserve(total);
        dst.put_u16(total as u16);
        for field in item.fields() {
            dst.put_slice(field.as_bytes());
            dst.put_u8(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LobbyCodec, buf: &mut BytesMut) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Some(pkt) = codec.decode(buf).unwrap() {
            out.push(pkt.fields().to_vec());
        }
        out
    }

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_single_field() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x07aaaa\x00"[..]);
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.fields(), &["aaaa"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_several_fields() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x10aaaa\x00bbb\x00cc\x00d\x00"[..]);
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.fields(), &["aaaa", "bbb", "cc", "d"]);
    }

    #[test]
    fn decode_empty_field() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x03\x00"[..]);
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.fields(), &[""]);
    }

    #[test]
    fn decode_two_packets_in_one_read() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x07aaaa\x00\x00\x07aaaa\x00"[..]);
        let pkts = decode_all(&mut codec, &mut buf);
        assert_eq!(pkts, vec![vec!["aaaa"], vec!["aaaa"]]);
    }

    #[test]
    fn decode_fragmented_packets() {
        // Two frames split mid-field and mid-header, plus a trailing
        // header for a frame that never completes.
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"\x00\x0aCLI");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ENTS\x00\x00\x0a");
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.fields(), &["CLIENTS"]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"CLIENTS\x00\x00\x08");
        let pkt = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt.fields(), &["CLIENTS"]);

        // The trailing "\x00\x08" header stays buffered.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"\x00\x08");
    }

    #[test]
    fn decode_incomplete_header() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"\x00");
    }

    #[test]
    fn decode_rejects_undersized_length() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x02"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::BadLength(2)));
    }

    #[test]
    fn decode_rejects_unterminated_payload() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x05abc"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MissingTerminator));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::from(&b"\x00\x05\xff\xfe\x00"[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            CodecError::Io(_)
        ));
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_prefixes_length_and_terminates_fields() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::new();
        let mut pkt = Packet::new();
        pkt.add("CHAT");
        pkt.add("hello there");
        pkt.add("");
        codec.encode(pkt, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x14CHAT\x00hello there\x00\x00");
    }

    #[test]
    fn encode_renders_ints_and_bools() {
        let mut codec = LobbyCodec;
        let mut buf = BytesMut::new();
        let mut pkt = Packet::new();
        pkt.add("LOGIN");
        pkt.add(0);
        pkt.add(false);
        codec.encode(pkt, &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x10LOGIN\x000\x00false\x00");
    }

    // ── Roundtrip ────────────────────────────────────────────────

    #[test]
    fn roundtrip_through_codec() {
        let mut codec = LobbyCodec;
        let mut pkt = Packet::new();
        pkt.add("CHAT");
        pkt.add("hello <rt>there</rt>\nhow<rtdoyoudo");
        pkt.add("ernie");

        let mut buf = BytesMut::new();
        codec.encode(pkt.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.fields(), pkt.fields());
        assert!(buf.is_empty());
    }
}
