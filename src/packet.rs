//! Binary section and packet layout
//!
//! A compressed vector's binary section starts with a fixed 32-byte header
//! and is otherwise a run of packets. Every packet starts with the same
//! 4-byte header; DATA packets then carry a bytestream directory (one 16-bit
//! length per stream) followed by the stream payloads back to back. All
//! integers are little-endian and every packet length is a multiple of 4.

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{Error, Result};

/// Packet type byte for index packets
pub const INDEX_PACKET: u8 = 0;
/// Packet type byte for data packets
pub const DATA_PACKET: u8 = 1;
/// Packet type byte for empty (padding) packets
pub const EMPTY_PACKET: u8 = 2;

/// Size of the header shared by all packet types
pub const PACKET_HEADER_SIZE: usize = 4;

/// Size of the section header at the start of a compressed vector section
pub const SECTION_HEADER_SIZE: usize = 32;

/// Section id byte identifying a compressed vector binary section
pub const COMPRESSED_VECTOR_SECTION_ID: u8 = 1;

/// Header shared by all packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub flags: u8,
    /// Real packet length in logical bytes (the on-disk field stores length minus one).
    pub logical_length: u32,
}

impl PacketHeader {
    /// Parse and validate the shared header at the front of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(Error::BadPacket {
                context: format!("packet header truncated to {} bytes", data.len()),
            });
        }

        let packet_type = data[0];
        if packet_type != INDEX_PACKET && packet_type != DATA_PACKET && packet_type != EMPTY_PACKET
        {
            return Err(Error::BadPacket {
                context: format!("unknown packet type {packet_type:#04x}"),
            });
        }

        let flags = data[1];
        let logical_length = u32::from(u16::from_le_bytes([data[2], data[3]])) + 1;
        if logical_length % 4 != 0 {
            return Err(Error::BadPacket {
                context: format!("packet length {logical_length} is not a multiple of 4"),
            });
        }

        Ok(Self {
            packet_type,
            flags,
            logical_length,
        })
    }
}

/// Parsed view of one DATA packet.
///
/// Parsing walks the bytestream directory once; stream lookups afterwards are
/// constant time slices into the packet buffer.
#[derive(Debug)]
pub struct DataPacket<'a> {
    header: PacketHeader,
    /// Byte offset of each stream payload inside `data`, plus a final end offset.
    stream_offsets: Vec<usize>,
    data: &'a [u8],
}

impl<'a> DataPacket<'a> {
    /// Parse a full packet buffer as a DATA packet.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = PacketHeader::parse(data)?;
        if header.packet_type != DATA_PACKET {
            return Err(Error::BadPacket {
                context: format!("expected data packet, got type {:#04x}", header.packet_type),
            });
        }

        let length = header.logical_length as usize;
        if length > data.len() {
            return Err(Error::BadPacket {
                context: format!(
                    "packet claims {length} bytes but only {} are present",
                    data.len()
                ),
            });
        }

        let mut cursor = &data[PACKET_HEADER_SIZE..length];
        let stream_count = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| Error::BadPacket {
                context: "data packet too short for bytestream count".into(),
            })? as usize;
        if stream_count == 0 {
            return Err(Error::BadPacket {
                context: "data packet declares zero bytestreams".into(),
            });
        }

        let directory_end = PACKET_HEADER_SIZE + 2 + 2 * stream_count;
        if directory_end > length {
            return Err(Error::BadPacket {
                context: format!(
                    "bytestream directory of {stream_count} entries overruns packet length {length}"
                ),
            });
        }

        let mut stream_offsets = Vec::with_capacity(stream_count + 1);
        let mut offset = directory_end;
        stream_offsets.push(offset);
        for _ in 0..stream_count {
            let stream_length = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| Error::BadPacket {
                    context: "data packet too short for bytestream directory".into(),
                })? as usize;
            offset += stream_length;
            stream_offsets.push(offset);
        }

        if offset > length {
            return Err(Error::BadPacket {
                context: format!(
                    "bytestream payloads end at {offset}, past packet length {length}"
                ),
            });
        }

        Ok(Self {
            header,
            stream_offsets,
            data,
        })
    }

    /// The shared packet header.
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Number of bytestreams in this packet's directory.
    pub fn bytestream_count(&self) -> usize {
        self.stream_offsets.len() - 1
    }

    /// Payload length of bytestream `index`.
    pub fn bytestream_length(&self, index: usize) -> usize {
        self.stream_offsets[index + 1] - self.stream_offsets[index]
    }

    /// Payload slice of bytestream `index`.
    pub fn bytestream(&self, index: usize) -> &'a [u8] {
        &self.data[self.stream_offsets[index]..self.stream_offsets[index + 1]]
    }
}

/// Fixed-size header at the start of a compressed vector binary section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Total section length in logical bytes, header included.
    pub section_logical_length: u64,
    /// Physical offset of the first DATA packet.
    pub data_physical_offset: u64,
    /// Physical offset of the first index packet, zero if none was written.
    pub index_physical_offset: u64,
}

impl SectionHeader {
    /// Parse the 32-byte section header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SECTION_HEADER_SIZE {
            return Err(Error::BadPacket {
                context: format!("section header truncated to {} bytes", data.len()),
            });
        }
        if data[0] != COMPRESSED_VECTOR_SECTION_ID {
            return Err(Error::BadPacket {
                context: format!("section id {:#04x} is not a compressed vector section", data[0]),
            });
        }

        let mut cursor = &data[8..SECTION_HEADER_SIZE];
        let mut next_u64 = || -> Result<u64> {
            cursor.read_u64::<LittleEndian>().map_err(|_| Error::BadPacket {
                context: "section header too short".into(),
            })
        };
        let section_logical_length = next_u64()?;
        let data_physical_offset = next_u64()?;
        let index_physical_offset = next_u64()?;

        Ok(Self {
            section_logical_length,
            data_physical_offset,
            index_physical_offset,
        })
    }

    /// Serialize to the on-disk 32-byte layout.
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[0] = COMPRESSED_VECTOR_SECTION_ID;
        out[8..16].copy_from_slice(&self.section_logical_length.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_physical_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.index_physical_offset.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_data_packet(streams: &[&[u8]]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(streams.len() as u16).to_le_bytes());
        for s in streams {
            body.extend_from_slice(&(s.len() as u16).to_le_bytes());
        }
        for s in streams {
            body.extend_from_slice(s);
        }

        let mut length = PACKET_HEADER_SIZE + body.len();
        length += (4 - length % 4) % 4;

        let mut packet = Vec::with_capacity(length);
        packet.push(DATA_PACKET);
        packet.push(0);
        packet.extend_from_slice(&((length - 1) as u16).to_le_bytes());
        packet.extend_from_slice(&body);
        packet.resize(length, 0);
        packet
    }

    #[test]
    fn test_header_round_trip() {
        let header = PacketHeader::parse(&[INDEX_PACKET, 0, 0x0B, 0x00, 0xFF]).unwrap();
        assert_eq!(header.packet_type, INDEX_PACKET);
        assert_eq!(header.logical_length, 12);

        let err = PacketHeader::parse(&[7, 0, 0x0B, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");

        // length 11 is not a multiple of 4
        let err = PacketHeader::parse(&[DATA_PACKET, 0, 0x0A, 0x00]).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_data_packet_directory() {
        let packet = build_data_packet(&[b"abcd", b"", b"xyz"]);
        let parsed = DataPacket::parse(&packet).unwrap();

        assert_eq!(parsed.bytestream_count(), 3);
        assert_eq!(parsed.bytestream_length(0), 4);
        assert_eq!(parsed.bytestream_length(1), 0);
        assert_eq!(parsed.bytestream_length(2), 3);
        assert_eq!(parsed.bytestream(0), b"abcd");
        assert_eq!(parsed.bytestream(1), b"");
        assert_eq!(parsed.bytestream(2), b"xyz");
    }

    #[test]
    fn test_data_packet_directory_overrun() {
        let mut packet = build_data_packet(&[b"abcd"]);
        // Inflate the declared stream length past the packet end
        packet[6] = 0xFF;
        packet[7] = 0x0F;
        let err = DataPacket::parse(&packet).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_non_data_packet_rejected() {
        let packet = [EMPTY_PACKET, 0, 0x03, 0x00];
        let err = DataPacket::parse(&packet).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_section_header_round_trip() {
        let header = SectionHeader {
            section_logical_length: 0x1234,
            data_physical_offset: 0x40,
            index_physical_offset: 0,
        };
        let bytes = header.to_bytes();
        assert_eq!(SectionHeader::parse(&bytes).unwrap(), header);

        let mut bad = bytes;
        bad[0] = 9;
        let err = SectionHeader::parse(&bad).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");
    }
}
