//! Compressed vector reader
//!
//! The reader owns one decode channel per bound bytestream and a packet
//! cache, and drains the binary section with a multi-channel drive loop:
//! find the earliest packet any hungry channel still needs, pin it, hand
//! each co-located channel its slice of the packet's bytestream, and advance
//! channels that exhausted the packet to the next DATA packet (skipping
//! index and empty packets). A read call ends when every buffer is full or
//! every channel has run out of section.
//!
//! Channels at the same packet are all fed in one pass; order between them
//! does not matter because their bytestreams are disjoint slices of the
//! packet.

use tracing::{debug, trace};

use crate::binding::BufferBinding;
use crate::cache::PacketCache;
use crate::decoder::Decoder;
use crate::image_file::CompressedVector;
use crate::packet::{DataPacket, PacketHeader, SectionHeader, DATA_PACKET, SECTION_HEADER_SIZE};
use crate::paged_file::PagedFile;
use crate::{Error, Result};

struct DecodeChannel {
    bytestream: usize,
    decoder: Decoder,
    binding: BufferBinding,
    current_packet_logical_offset: u64,
    current_buffer_index: usize,
    current_buffer_length: usize,
    input_finished: bool,
}

impl DecodeChannel {
    fn is_output_blocked(&self) -> bool {
        self.binding.is_full()
    }

    /// The channel has eaten its whole bytestream slice of the current packet.
    fn is_input_blocked(&self) -> bool {
        self.current_buffer_index == self.current_buffer_length
    }

    fn already_read_packet(&self, offset: u64) -> bool {
        self.current_packet_logical_offset != offset || self.is_output_blocked()
    }
}

/// Streaming reader over one compressed vector's binary section.
pub struct CompressedVectorReader {
    vector: CompressedVector,
    bindings: Vec<BufferBinding>,
    channels: Vec<DecodeChannel>,
    cache: PacketCache,
    section_end_logical_offset: u64,
    is_open: bool,
}

impl std::fmt::Debug for CompressedVectorReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedVectorReader")
            .field("is_open", &self.is_open)
            .finish_non_exhaustive()
    }
}

impl CompressedVectorReader {
    pub(crate) fn open(
        vector: CompressedVector,
        bindings: &[BufferBinding],
        cache_slots: usize,
    ) -> Result<Self> {
        let context = vector.error_context();
        Self::open_inner(vector, bindings, cache_slots)
            .map_err(|error| attach_context(&context, error))
    }

    fn open_inner(
        vector: CompressedVector,
        bindings: &[BufferBinding],
        cache_slots: usize,
    ) -> Result<Self> {
        let image_file = vector.image_file()?;
        image_file.check_open(&vector.error_context())?;

        if bindings.is_empty() {
            return Err(Error::BadApiArgument {
                context: "no buffers supplied".into(),
            });
        }

        let cache = PacketCache::new(image_file.file(), cache_slots);
        let mut reader = Self {
            vector,
            bindings: Vec::new(),
            channels: Vec::new(),
            cache,
            section_end_logical_offset: 0,
            is_open: false,
        };
        reader.set_bindings(bindings)?;

        let record_count = reader.vector.record_count();
        for (index, binding) in reader.bindings.iter().enumerate() {
            let path = binding.path_name();
            let (bytestream, element) = reader
                .vector
                .prototype()
                .find_terminal(&path)
                .ok_or_else(|| Error::Internal {
                    context: format!("checked pathName {path} has no terminal"),
                    detail: index as u64,
                })?;
            reader.channels.push(DecodeChannel {
                bytestream,
                decoder: Decoder::for_element(element, record_count),
                binding: binding.clone(),
                current_packet_logical_offset: 0,
                current_buffer_index: 0,
                current_buffer_length: 0,
                input_finished: false,
            });
        }

        let section_start = reader.vector.section_logical_start();
        if section_start == 0 {
            return Err(Error::Internal {
                context: "compressed vector has no binary section".into(),
                detail: 0,
            });
        }

        let mut header_bytes = [0u8; SECTION_HEADER_SIZE];
        image_file
            .file()
            .borrow_mut()
            .read_at_logical(section_start, &mut header_bytes)?;
        let section_header = SectionHeader::parse(&header_bytes)?;
        reader.section_end_logical_offset = section_start + section_header.section_logical_length;
        let data_logical_offset =
            PagedFile::physical_to_logical(section_header.data_physical_offset);

        // The first packet of a section must be a data packet; check it and
        // point every channel at it.
        {
            let lock = reader.cache.lock(data_logical_offset)?;
            let packet = DataPacket::parse(lock.packet())?;
            let terminal_count = reader.vector.prototype().terminal_count();
            if packet.bytestream_count() != terminal_count {
                return Err(Error::BadPacket {
                    context: format!(
                        "packet has {} bytestreams, prototype has {terminal_count}",
                        packet.bytestream_count()
                    ),
                });
            }
            for channel in &mut reader.channels {
                channel.current_packet_logical_offset = data_logical_offset;
                channel.current_buffer_index = 0;
                channel.current_buffer_length = packet.bytestream_length(channel.bytestream);
            }
        }

        image_file.incr_reader_count();
        reader.is_open = true;
        debug!(
            "opened reader for {} ({} channels, section logical [{section_start}, {}))",
            reader.vector.path_name(),
            reader.channels.len(),
            reader.section_end_logical_offset
        );
        Ok(reader)
    }

    /// Whether the reader is still open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Packet cache slots currently pinned; zero between calls.
    pub fn pinned_packets(&self) -> usize {
        self.cache.pinned_slots()
    }

    /// Read the next block of records into the buffers set at open.
    ///
    /// Returns the number of records delivered, which is the same for every
    /// buffer. Zero means the section is exhausted.
    pub fn read(&mut self) -> Result<usize> {
        let context = self.vector.error_context();
        self.read_inner().map_err(|error| attach_context(&context, error))
    }

    /// Read into a replacement buffer set, which must be compatible with the
    /// set the reader was opened with.
    pub fn read_into(&mut self, bindings: &[BufferBinding]) -> Result<usize> {
        let context = self.vector.error_context();
        self.check_reader_open()?;
        self.set_bindings(bindings)
            .map_err(|error| attach_context(&context, error))?;
        self.read()
    }

    /// Position the reader at an arbitrary record.
    pub fn seek(&mut self, _record_index: u64) -> Result<()> {
        let image_file = self.vector.image_file()?;
        image_file.check_open(&self.vector.error_context())?;
        Err(Error::NotImplemented {
            context: format!("{} seek", self.vector.error_context()),
        })
    }

    /// Close the reader. A second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        // Release the section before the open-file guard so a close that
        // races file teardown still lets go of the reader count.
        if let Ok(image_file) = self.vector.image_file() {
            image_file.decr_reader_count();
            image_file.check_open(&self.vector.error_context())?;
        }

        self.channels.clear();
        self.cache.clear();
        debug!("closed reader for {}", self.vector.path_name());
        Ok(())
    }

    fn check_reader_open(&self) -> Result<()> {
        if !self.is_open {
            return Err(Error::ReaderNotOpen {
                context: self.vector.error_context(),
            });
        }
        Ok(())
    }

    fn set_bindings(&mut self, bindings: &[BufferBinding]) -> Result<()> {
        if bindings.is_empty() {
            return Err(Error::BadApiArgument {
                context: "no buffers supplied".into(),
            });
        }
        self.vector.prototype().check_bindings(bindings, true)?;

        let capacity = bindings[0].capacity();
        for binding in bindings {
            if binding.capacity() != capacity {
                return Err(Error::BadApiArgument {
                    context: format!(
                        "buffer capacities differ: {} for {} vs {capacity}",
                        binding.capacity(),
                        binding.path_name()
                    ),
                });
            }
        }

        if !self.bindings.is_empty() {
            if self.bindings.len() != bindings.len() {
                return Err(Error::BuffersNotCompatible {
                    context: format!(
                        "buffer count changed from {} to {}",
                        self.bindings.len(),
                        bindings.len()
                    ),
                });
            }
            for (old, new) in self.bindings.iter().zip(bindings) {
                old.check_compatible(new)?;
            }
        }

        self.bindings = bindings.to_vec();
        for (channel, binding) in self.channels.iter_mut().zip(&self.bindings) {
            channel.binding = binding.clone();
        }
        Ok(())
    }

    fn read_inner(&mut self) -> Result<usize> {
        let image_file = self.vector.image_file()?;
        image_file.check_open(&self.vector.error_context())?;
        self.check_reader_open()?;

        for binding in &self.bindings {
            binding.rewind();
        }

        // Let decoders flush staged bytes into the freshly rewound buffers
        // before any packet is fetched; it keeps their input queues short.
        for channel in &mut self.channels {
            channel.decoder.input_process(&channel.binding, &[])?;
        }

        loop {
            let Some(earliest) = self.earliest_packet_needed() else {
                break;
            };
            self.feed_packet(earliest)?;
        }

        let output_count = self.bindings[0].next_index();
        for (index, binding) in self.bindings.iter().enumerate().skip(1) {
            if binding.next_index() != output_count {
                return Err(Error::Internal {
                    context: format!(
                        "channels delivered different record counts: {output_count} vs {}",
                        binding.next_index()
                    ),
                    detail: index as u64,
                });
            }
        }
        trace!("read call delivered {output_count} records");
        Ok(output_count)
    }

    /// Earliest packet offset needed by a channel that is neither full nor
    /// out of input. `None` means the read call is complete.
    fn earliest_packet_needed(&self) -> Option<u64> {
        self.channels
            .iter()
            .filter(|channel| !channel.is_output_blocked() && !channel.input_finished)
            .map(|channel| channel.current_packet_logical_offset)
            .min()
    }

    fn feed_packet(&mut self, current_offset: u64) -> Result<()> {
        let terminal_count = self.vector.prototype().terminal_count();
        let mut any_exhausted = false;
        let mut next_packet_logical_offset = None;

        {
            let lock = self.cache.lock(current_offset)?;
            let header = PacketHeader::parse(lock.packet())?;
            // Bookkeeping guaranteed this offset holds a data packet
            if header.packet_type != DATA_PACKET {
                return Err(Error::Internal {
                    context: format!(
                        "packet at logical offset {current_offset} has type {}",
                        header.packet_type
                    ),
                    detail: current_offset,
                });
            }
            let packet = DataPacket::parse(lock.packet())?;
            if packet.bytestream_count() != terminal_count {
                return Err(Error::BadPacket {
                    context: format!(
                        "packet has {} bytestreams, prototype has {terminal_count}",
                        packet.bytestream_count()
                    ),
                });
            }

            for (index, channel) in self.channels.iter_mut().enumerate() {
                if channel.already_read_packet(current_offset) {
                    continue;
                }

                let stream = packet.bytestream(channel.bytestream);
                if channel.current_buffer_index > stream.len() {
                    return Err(Error::Internal {
                        context: format!(
                            "bytestream cursor {} past stream length {}",
                            channel.current_buffer_index,
                            stream.len()
                        ),
                        detail: index as u64,
                    });
                }

                let uneaten = &stream[channel.current_buffer_index..];
                let consumed = channel.decoder.input_process(&channel.binding, uneaten)?;
                channel.current_buffer_index += consumed;
                trace!(
                    "bytestream {} consumed {consumed} of {} bytes at offset {current_offset}",
                    channel.bytestream,
                    uneaten.len()
                );

                if channel.is_input_blocked() {
                    any_exhausted = true;
                    next_packet_logical_offset =
                        Some(current_offset + u64::from(header.logical_length));
                }
            }
        }

        // The search runs even when nothing exhausted; the early return
        // below then discards its result.
        let next_data = self.find_next_data_packet(next_packet_logical_offset)?;
        if !any_exhausted {
            return Ok(());
        }

        match next_data {
            Some(next_offset) => {
                let lock = self.cache.lock(next_offset)?;
                let packet = DataPacket::parse(lock.packet())?;
                if packet.bytestream_count() != terminal_count {
                    return Err(Error::BadPacket {
                        context: format!(
                            "packet has {} bytestreams, prototype has {terminal_count}",
                            packet.bytestream_count()
                        ),
                    });
                }
                for channel in self.channels.iter_mut() {
                    if channel.already_read_packet(current_offset) {
                        continue;
                    }
                    channel.current_packet_logical_offset = next_offset;
                    channel.current_buffer_index = 0;
                    // A zero length here is fine, the channel skips ahead on
                    // the next pass
                    channel.current_buffer_length = packet.bytestream_length(channel.bytestream);
                }
            }
            None => {
                for channel in self.channels.iter_mut() {
                    if channel.already_read_packet(current_offset) {
                        continue;
                    }
                    trace!("bytestream {} is out of data packets", channel.bytestream);
                    channel.input_finished = true;
                }
            }
        }
        Ok(())
    }

    /// Skip from `from` over index and empty packets to the next data packet,
    /// `None` once the scan leaves the section.
    fn find_next_data_packet(&mut self, from: Option<u64>) -> Result<Option<u64>> {
        let Some(mut offset) = from else {
            return Ok(None);
        };
        while offset < self.section_end_logical_offset {
            let lock = self.cache.lock(offset)?;
            let header = PacketHeader::parse(lock.packet())?;
            if header.packet_type == DATA_PACKET {
                return Ok(Some(offset));
            }
            offset += u64::from(header.logical_length);
        }
        Ok(None)
    }
}

impl Drop for CompressedVectorReader {
    fn drop(&mut self) {
        if self.is_open {
            // A failing close during drop has nowhere to report
            let _ = self.close();
        }
    }
}

fn attach_context(context: &str, error: Error) -> Error {
    let widen = |detail: String| {
        if detail.starts_with("imageFile=") {
            detail
        } else {
            format!("{context} {detail}")
        }
    };
    match error {
        Error::BadApiArgument { context } => Error::BadApiArgument {
            context: widen(context),
        },
        Error::BuffersNotCompatible { context } => Error::BuffersNotCompatible {
            context: widen(context),
        },
        Error::BadPacket { context } => Error::BadPacket {
            context: widen(context),
        },
        Error::NoBufferForElement { context } => Error::NoBufferForElement {
            context: widen(context),
        },
        Error::ConversionRequired { context } => Error::ConversionRequired {
            context: widen(context),
        },
        Error::ValueOutOfRange { context } => Error::ValueOutOfRange {
            context: widen(context),
        },
        Error::Internal { context, detail } => Error::Internal {
            context: widen(context),
            detail,
        },
        other => other,
    }
}
