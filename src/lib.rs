//! Streaming reader for E57 compressed vector sections
//!
//! E57 (ASTM E2807) stores point records in compressed vector sections: a
//! binary byte range made of packets, where each DATA packet carries one
//! slice of every field's bytestream. This crate implements the read
//! pipeline for such a section — checksummed page access, a packet cache
//! with scoped locks, per-field decoders, and the multi-channel drive loop
//! that keeps every bound buffer advancing in lock step.
//!
//! ## Reading records
//!
//! Describe the record schema with a [`Prototype`], point a
//! [`CompressedVector`] at the section, bind one [`BufferBinding`] per field
//! you want, and call [`CompressedVectorReader::read`] until it returns
//! zero. Every buffer receives the same number of records per call.
//!
//! The XML header layer that would normally discover sections and prototypes
//! is out of scope here; callers provide those facts directly.

pub mod binding;
pub mod cache;
pub mod decoder;
pub mod error;
pub mod image_file;
pub mod packet;
pub mod paged_file;
pub mod prototype;
pub mod reader;

pub use binding::{BufferBinding, MemoryRepr, StringVec};
pub use cache::{PacketCache, PacketLock, DEFAULT_CACHE_SLOTS};
pub use error::{Error, Result};
pub use image_file::{CompressedVector, ImageFile};
pub use packet::{
    DataPacket, PacketHeader, SectionHeader, COMPRESSED_VECTOR_SECTION_ID, DATA_PACKET,
    EMPTY_PACKET, INDEX_PACKET, PACKET_HEADER_SIZE, SECTION_HEADER_SIZE,
};
pub use paged_file::{PagedFile, PagedWriter, PAGE_PAYLOAD, PAGE_SIZE};
pub use prototype::{ElementType, Prototype, PrototypeNode};
pub use reader::CompressedVectorReader;
