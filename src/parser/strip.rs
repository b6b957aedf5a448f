use crate::packet::Packet;
use crate::parser::{pass_through, ParseError};

/// Discards a fixed size link header in front of every packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripParser {
    header_size: usize,
    strip_left: usize,
}

impl StripParser {
    pub fn new(header_size: usize) -> Self {
        Self {
            header_size,
            strip_left: header_size,
        }
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn parse(&mut self, buf: &[u8], pkt: &mut Packet) -> Result<usize, ParseError> {
        let mut idx = 0;
        while idx < buf.len() {
            if self.strip_left > 0 {
                let skip = self.strip_left.min(buf.len() - idx);
                self.strip_left -= skip;
                idx += skip;
                continue;
            }
            idx += pass_through(&buf[idx..], pkt)?;
            if pkt.is_full() {
                self.goto_init_state(false);
                break;
            }
        }
        Ok(idx)
    }

    pub fn goto_init_state(&mut self, _reset: bool) {
        self.strip_left = self.header_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripConfig;
    use crate::packet::PacketKind;
    use crate::parser::tests::{collect_packets, tlm_packet};
    use crate::parser::FrameParser;

    fn framed(header: &[u8], packets: &[Vec<u8>]) -> Vec<u8> {
        let mut stream = Vec::new();
        for pkt in packets {
            stream.extend_from_slice(header);
            stream.extend_from_slice(pkt);
        }
        stream
    }

    #[test]
    fn test_strip_each_packet() {
        let packets = vec![tlm_packet(3, 0, &[1; 10]), tlm_packet(3, 1, &[2; 4])];
        let stream = framed(&[0xDE, 0xAD, 0xBE, 0xEF], &packets);
        let mut parser = FrameParser::strip(&StripConfig { header_size: 4 });
        let (parsed, errors) = collect_packets(&mut parser, PacketKind::Space, &[&stream]);
        assert_eq!(errors, 0);
        assert_eq!(parsed, packets);
    }

    #[test]
    fn test_strip_across_chunks() {
        let packets = vec![
            tlm_packet(3, 0, &[1; 10]),
            tlm_packet(4, 0, &[2; 4]),
            tlm_packet(5, 0, &[3; 7]),
        ];
        let stream = framed(&[0xAA; 3], &packets);
        let chunks: Vec<&[u8]> = stream.chunks(5).collect();
        let mut parser = FrameParser::strip(&StripConfig { header_size: 3 });
        let (parsed, errors) = collect_packets(&mut parser, PacketKind::Space, &chunks);
        assert_eq!(errors, 0);
        assert_eq!(parsed, packets);
    }

    #[test]
    fn test_zero_header_is_pass_through() {
        let packets = vec![tlm_packet(1, 0, &[1; 3]), tlm_packet(1, 1, &[1; 3])];
        let stream = framed(&[], &packets);
        let mut parser = StripParser::new(0);
        assert_eq!(parser.header_size(), 0);
        let mut pkt = Packet::new(PacketKind::Space);
        assert_eq!(parser.parse(&stream, &mut pkt).unwrap(), packets[0].len());
        assert!(pkt.is_full());
    }
}
