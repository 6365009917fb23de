//! Streaming writer for the classic pcap capture format.
//!
//! Emits the byte stream external packet analyzers consume: one 24-byte
//! global header followed by a 16-byte record header plus raw link-layer
//! bytes per packet, all little-endian. Records are flushed individually so
//! a live consumer on the other end of a pipe sees them immediately.

use std::io::Write;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65535;
const LINKTYPE_ETHERNET: u32 = 1;

/// Writes a pcap stream into any byte sink.
pub struct PcapStreamWriter<W: Write> {
    writer: W,
}

impl<W: Write> PcapStreamWriter<W> {
    /// Wrap `writer` and emit the global header.
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
        writer.write_all(&0i32.to_le_bytes())?; // thiszone
        writer.write_all(&0u32.to_le_bytes())?; // sigfigs
        writer.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
        writer.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;
        writer.flush()?;

        Ok(Self { writer })
    }

    /// Append one packet record with the given capture timestamp.
    pub fn write_packet(&mut self, ts_sec: u32, ts_usec: u32, data: &[u8]) -> std::io::Result<()> {
        let len = data.len() as u32;

        self.writer.write_all(&ts_sec.to_le_bytes())?;
        self.writer.write_all(&ts_usec.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?; // incl_len
        self.writer.write_all(&len.to_le_bytes())?; // orig_len
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

/// Split a relative timestamp in seconds into whole seconds and the
/// microseconds remainder, as carried by a pcap record header.
pub fn sec_split_usec(ts: f64) -> (u32, u32) {
    let ts = ts.max(0.0);
    let sec = ts.trunc();
    let usec = ((ts - sec) * 1_000_000.0).round() as u32;

    (sec as u32, usec.min(999_999))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_header_layout() {
        let mut buf = Vec::new();
        PcapStreamWriter::new(&mut buf).unwrap();

        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..4], &0xa1b2c3d4u32.to_le_bytes());
        assert_eq!(&buf[4..6], &2u16.to_le_bytes());
        assert_eq!(&buf[6..8], &4u16.to_le_bytes());
        assert_eq!(&buf[20..24], &1u32.to_le_bytes());
    }

    #[test]
    fn record_layout() {
        let mut buf = Vec::new();
        let mut writer = PcapStreamWriter::new(&mut buf).unwrap();
        writer.write_packet(7, 250_000, &[0xde, 0xad, 0xbe, 0xef]).unwrap();

        // global header (24) + record header (16) + data (4)
        assert_eq!(buf.len(), 44);
        assert_eq!(&buf[24..28], &7u32.to_le_bytes());
        assert_eq!(&buf[28..32], &250_000u32.to_le_bytes());
        assert_eq!(&buf[32..36], &4u32.to_le_bytes());
        assert_eq!(&buf[36..40], &4u32.to_le_bytes());
        assert_eq!(&buf[40..44], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn timestamp_split() {
        assert_eq!(sec_split_usec(0.0), (0, 0));
        assert_eq!(sec_split_usec(2.5), (2, 500_000));
        assert_eq!(sec_split_usec(13.000001), (13, 1));
    }

    #[test]
    fn timestamp_split_clamps() {
        // slight negative skew between client and server clocks
        assert_eq!(sec_split_usec(-0.25), (0, 0));
        // rounding must never spill into the next second
        let (_, usec) = sec_split_usec(1.9999999);
        assert!(usec <= 999_999);
    }
}
