//! Fixture assembly for the reader integration tests
//!
//! Sections are built byte by byte: bit-packed bytestreams, data packets
//! with their directories, filler packets, and finally the checksummed page
//! stream with a section header. A small preamble stands in for the file
//! header and XML that a complete E57 file would carry before the section.

use e57_stream::{
    CompressedVector, ImageFile, PagedFile, PagedWriter, Prototype, SectionHeader, DATA_PACKET,
    SECTION_HEADER_SIZE,
};
use std::path::Path;

/// Logical bytes before the section start, so offset zero stays reserved.
pub const PREAMBLE: u64 = 48;

/// Bit width of an integer element with the given bounds.
pub fn bits_needed(min: i64, max: i64) -> u32 {
    let range = (max as i128 - min as i128) as u128;
    if range == 0 {
        0
    } else {
        128 - range.leading_zeros()
    }
}

/// Pack integer values as LSB-first bitfields of `bits_needed(min, max)` bits.
pub fn pack_ints(values: &[i64], min: i64, max: i64) -> Vec<u8> {
    let width = bits_needed(min, max);
    let mut out = Vec::new();
    let mut acc = 0u128;
    let mut bits = 0u32;
    for &value in values {
        let raw = (value as i128 - min as i128) as u128;
        acc |= raw << bits;
        bits += width;
        while bits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push((acc & 0xFF) as u8);
    }
    out
}

/// Little-endian doubles, back to back.
pub fn pack_doubles(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Length-prefixed UTF-8 strings, back to back.
pub fn pack_strings(values: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Assemble a DATA packet holding one slice per bytestream.
pub fn data_packet(streams: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(streams.len() as u16).to_le_bytes());
    for stream in streams {
        body.extend_from_slice(&(stream.len() as u16).to_le_bytes());
    }
    for stream in streams {
        body.extend_from_slice(stream);
    }

    let mut length = 4 + body.len();
    length += (4 - length % 4) % 4;
    assert!(length - 1 <= u16::MAX as usize, "packet too long");

    let mut packet = Vec::with_capacity(length);
    packet.push(DATA_PACKET);
    packet.push(0);
    packet.extend_from_slice(&((length - 1) as u16).to_le_bytes());
    packet.extend_from_slice(&body);
    packet.resize(length, 0);
    packet
}

/// Assemble an INDEX or EMPTY packet of `length` bytes (header included).
pub fn filler_packet(packet_type: u8, length: usize) -> Vec<u8> {
    assert!(length % 4 == 0 && length >= 4);
    let mut packet = vec![0u8; length];
    packet[0] = packet_type;
    packet[2..4].copy_from_slice(&((length - 1) as u16).to_le_bytes());
    packet
}

/// Write a paged file holding a preamble plus one section with `packets`.
/// Returns the section's logical start offset.
pub fn write_section(path: &Path, packets: &[Vec<u8>]) -> u64 {
    let packet_bytes: u64 = packets.iter().map(|p| p.len() as u64).sum();
    write_section_with_length(path, packets, SECTION_HEADER_SIZE as u64 + packet_bytes)
}

/// Like [`write_section`] with an explicit `section_logical_length`, for
/// sections whose declared length does not cover every packet written.
pub fn write_section_with_length(
    path: &Path,
    packets: &[Vec<u8>],
    section_logical_length: u64,
) -> u64 {
    let section_start = PREAMBLE;
    let first_packet_logical = section_start + SECTION_HEADER_SIZE as u64;
    let header = SectionHeader {
        section_logical_length,
        data_physical_offset: PagedFile::logical_to_physical(first_packet_logical),
        index_physical_offset: 0,
    };

    let mut writer = PagedWriter::create(path).unwrap();
    writer.write(&[0u8; PREAMBLE as usize]).unwrap();
    writer.write(&header.to_bytes()).unwrap();
    for packet in packets {
        writer.write(packet).unwrap();
    }
    writer.finish().unwrap();
    section_start
}

/// Open the fixture file and describe its section as a compressed vector.
pub fn open_vector(
    path: &Path,
    prototype: Prototype,
    record_count: u64,
) -> (ImageFile, CompressedVector) {
    let image_file = ImageFile::open(path).unwrap();
    let vector = CompressedVector::new(
        &image_file,
        "/data3D/0/points",
        prototype,
        record_count,
        PREAMBLE,
    );
    (image_file, vector)
}
