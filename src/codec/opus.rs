//! Opus frame inspection.
//!
//! The server never transcodes; frames stay opaque byte blobs between the
//! device and the providers. The only thing the session layer needs is the
//! TOC byte: frame duration for pacing and channel count for the hello
//! negotiation.

/// Parsed view of an opus TOC byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusToc {
    pub config: u8,
    pub stereo: bool,
    pub frames_in_packet: u8,
}

/// Inspect the first byte of an opus packet. Empty packets return `None`.
pub fn parse_toc(packet: &[u8]) -> Option<OpusToc> {
    let toc = *packet.first()?;
    let code = toc & 0x03;
    let frames_in_packet = match code {
        0 => 1,
        1 | 2 => 2,
        // Code 3: arbitrary frame count carried in the next byte.
        _ => packet.get(1).map_or(0, |b| b & 0x3f),
    };
    Some(OpusToc {
        config: toc >> 3,
        stereo: toc & 0x04 != 0,
        frames_in_packet,
    })
}

/// Duration of a single frame in microseconds for a TOC config value.
pub fn frame_duration_us(config: u8) -> u32 {
    // SILK-only and hybrid configs use 10-60 ms; CELT-only 2.5-20 ms.
    match config {
        0 | 4 | 8 => 10_000,
        1 | 5 | 9 => 20_000,
        2 | 6 | 10 => 40_000,
        3 | 7 | 11 => 60_000,
        12 | 14 => 10_000,
        13 | 15 => 20_000,
        16 | 20 | 24 | 28 => 2_500,
        17 | 21 | 25 | 29 => 5_000,
        18 | 22 | 26 | 30 => 10_000,
        _ => 20_000,
    }
}

/// Total packet duration in milliseconds, or 0 for malformed packets.
pub fn packet_duration_ms(packet: &[u8]) -> u32 {
    match parse_toc(packet) {
        Some(toc) => {
            frame_duration_us(toc.config) * u32::from(toc.frames_in_packet) / 1000
        }
        None => 0,
    }
}

/// A DTX-style silence packet: TOC only, or TOC plus a zero-length frame.
pub fn is_silence(packet: &[u8]) -> bool {
    packet.len() <= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toc_decodes_config_and_channels() {
        // config 14 (hybrid 20ms), stereo, code 0
        let toc = parse_toc(&[0b0111_0100, 0xff]).unwrap();
        assert_eq!(toc.config, 14);
        assert!(toc.stereo);
        assert_eq!(toc.frames_in_packet, 1);
        assert_eq!(packet_duration_ms(&[0b0111_0100, 0xff]), 20);
    }

    #[test]
    fn code_three_reads_frame_count() {
        let toc = parse_toc(&[0b0000_0011, 0x03]).unwrap();
        assert_eq!(toc.frames_in_packet, 3);
    }

    #[test]
    fn empty_packet_is_nothing() {
        assert!(parse_toc(&[]).is_none());
        assert_eq!(packet_duration_ms(&[]), 0);
        assert!(is_silence(&[]));
    }
}
