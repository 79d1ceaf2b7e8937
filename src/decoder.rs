//! Per-bytestream decoders
//!
//! Every terminal element of the prototype owns one bytestream and one
//! decoder. A decoder is fed byte slices from successive data packets and
//! writes decoded records through the buffer binding; it accepts only as
//! much input as it can use, staging partial records internally so a record
//! split across two packets decodes seamlessly. An empty input slice means
//! "drain what you already hold".
//!
//! Each decoder carries the vector's total record count and stops emitting
//! when it is reached; this is what keeps the padding bits at the tail of a
//! bit-packed stream, and constant elements that consume no input at all,
//! from materializing phantom records. Once the count is reached any further
//! input is swallowed so the drive loop can run the section out.

use crate::binding::BufferBinding;
use crate::prototype::ElementType;
use crate::{Error, Result};

/// Decoder state for one bytestream.
pub enum Decoder {
    BitPack(BitPackDecoder),
    ScaledInteger(ScaledIntegerDecoder),
    ConstantInteger(ConstantIntegerDecoder),
    Float(FloatDecoder),
    String(StringDecoder),
}

impl Decoder {
    /// Pick the decoder variant for a prototype terminal.
    pub fn for_element(element: &ElementType, record_count: u64) -> Self {
        match *element {
            ElementType::Integer { min, max } if min == max => {
                Self::ConstantInteger(ConstantIntegerDecoder::new(min, None, record_count))
            }
            ElementType::Integer { min, max } => {
                Self::BitPack(BitPackDecoder::new(min, max, record_count))
            }
            ElementType::ScaledInteger {
                min,
                max,
                scale,
                offset,
            } if min == max => Self::ConstantInteger(ConstantIntegerDecoder::new(
                min,
                Some((scale, offset)),
                record_count,
            )),
            ElementType::ScaledInteger {
                min,
                max,
                scale,
                offset,
            } => Self::ScaledInteger(ScaledIntegerDecoder::new(min, max, scale, offset, record_count)),
            ElementType::Float => Self::Float(FloatDecoder::new(false, record_count)),
            ElementType::Double => Self::Float(FloatDecoder::new(true, record_count)),
            ElementType::String => Self::String(StringDecoder::new(record_count)),
        }
    }

    /// Feed `input` to the decoder, writing records into `binding`.
    ///
    /// Returns the number of input bytes accepted; an unaccepted suffix must
    /// be presented again later. Pass an empty slice to drain staged data.
    pub fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        match self {
            Self::BitPack(decoder) => decoder.input_process(binding, input),
            Self::ScaledInteger(decoder) => decoder.input_process(binding, input),
            Self::ConstantInteger(decoder) => decoder.input_process(binding, input),
            Self::Float(decoder) => decoder.input_process(binding, input),
            Self::String(decoder) => decoder.input_process(binding, input),
        }
    }
}

/// Bit stage shared by the packed integer decoders.
///
/// Bytes are shifted in little-endian, records extracted LSB first. The
/// stage never holds more than one whole record plus seven carry bits, so a
/// `u128` covers the maximum 64-bit field width.
struct PackedStage {
    bit_width: u32,
    stage: u128,
    stage_bits: u32,
}

impl PackedStage {
    fn new(min: i64, max: i64) -> Self {
        let range = (max as i128 - min as i128) as u128;
        let bit_width = 128 - range.leading_zeros();
        Self {
            bit_width,
            stage: 0,
            stage_bits: 0,
        }
    }

    fn has_record(&self) -> bool {
        self.stage_bits >= self.bit_width
    }

    fn push_byte(&mut self, byte: u8) {
        self.stage |= (byte as u128) << self.stage_bits;
        self.stage_bits += 8;
    }

    fn take_raw(&mut self) -> u64 {
        let mask = (1u128 << self.bit_width) - 1;
        let raw = (self.stage & mask) as u64;
        self.stage >>= self.bit_width;
        self.stage_bits -= self.bit_width;
        raw
    }
}

fn drive_packed(
    stage: &mut PackedStage,
    emitted: &mut u64,
    record_count: u64,
    binding: &BufferBinding,
    input: &[u8],
    mut emit: impl FnMut(&BufferBinding, u64) -> Result<()>,
) -> Result<usize> {
    let mut consumed = 0;
    loop {
        if *emitted >= record_count {
            return Ok(input.len());
        }
        if stage.has_record() {
            if binding.is_full() {
                return Ok(consumed);
            }
            let raw = stage.take_raw();
            emit(binding, raw)?;
            *emitted += 1;
            continue;
        }
        if consumed < input.len() {
            stage.push_byte(input[consumed]);
            consumed += 1;
        } else {
            return Ok(consumed);
        }
    }
}

/// Bit-packed integer element: raw fields of `bits_needed(max - min)` bits,
/// semantic value `min + raw`.
pub struct BitPackDecoder {
    min: i64,
    stage: PackedStage,
    record_count: u64,
    emitted: u64,
}

impl BitPackDecoder {
    fn new(min: i64, max: i64, record_count: u64) -> Self {
        Self {
            min,
            stage: PackedStage::new(min, max),
            record_count,
            emitted: 0,
        }
    }

    fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        let min = self.min;
        drive_packed(
            &mut self.stage,
            &mut self.emitted,
            self.record_count,
            binding,
            input,
            |binding, raw| binding.store_i64(min.wrapping_add(raw as i64)),
        )
    }
}

/// Bit-packed integer with a linear value mapping; whether the raw or the
/// scaled value lands in memory is the binding's choice.
pub struct ScaledIntegerDecoder {
    min: i64,
    scale: f64,
    offset: f64,
    stage: PackedStage,
    record_count: u64,
    emitted: u64,
}

impl ScaledIntegerDecoder {
    fn new(min: i64, max: i64, scale: f64, offset: f64, record_count: u64) -> Self {
        Self {
            min,
            scale,
            offset,
            stage: PackedStage::new(min, max),
            record_count,
            emitted: 0,
        }
    }

    fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        let (min, scale, offset) = (self.min, self.scale, self.offset);
        let scaling = binding.do_scaling();
        drive_packed(
            &mut self.stage,
            &mut self.emitted,
            self.record_count,
            binding,
            input,
            |binding, raw| {
                let value = min.wrapping_add(raw as i64);
                if scaling {
                    binding.store_f64(value as f64 * scale + offset)
                } else {
                    binding.store_i64(value)
                }
            },
        )
    }
}

/// Element whose bounds pin it to a single value; its bytestream carries no
/// bytes, so records are minted straight from the prototype.
pub struct ConstantIntegerDecoder {
    value: i64,
    scaling: Option<(f64, f64)>,
    record_count: u64,
    emitted: u64,
}

impl ConstantIntegerDecoder {
    fn new(value: i64, scaling: Option<(f64, f64)>, record_count: u64) -> Self {
        Self {
            value,
            scaling,
            record_count,
            emitted: 0,
        }
    }

    fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        while self.emitted < self.record_count && !binding.is_full() {
            match self.scaling {
                Some((scale, offset)) if binding.do_scaling() => {
                    binding.store_f64(self.value as f64 * scale + offset)?
                }
                _ => binding.store_i64(self.value)?,
            }
            self.emitted += 1;
        }
        Ok(input.len())
    }
}

/// IEEE 754 element stored verbatim, little-endian.
pub struct FloatDecoder {
    double: bool,
    stage: [u8; 8],
    stage_len: usize,
    record_count: u64,
    emitted: u64,
}

impl FloatDecoder {
    fn new(double: bool, record_count: u64) -> Self {
        Self {
            double,
            stage: [0u8; 8],
            stage_len: 0,
            record_count,
            emitted: 0,
        }
    }

    fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        let element_size = if self.double { 8 } else { 4 };
        let mut consumed = 0;
        loop {
            if self.emitted >= self.record_count {
                return Ok(input.len());
            }
            if self.stage_len == element_size {
                if binding.is_full() {
                    return Ok(consumed);
                }
                let value = if self.double {
                    f64::from_le_bytes(self.stage)
                } else {
                    f32::from_le_bytes([self.stage[0], self.stage[1], self.stage[2], self.stage[3]])
                        as f64
                };
                binding.store_f64(value)?;
                self.stage_len = 0;
                self.emitted += 1;
                continue;
            }

            let want = element_size - self.stage_len;
            let have = input.len() - consumed;
            if have == 0 {
                return Ok(consumed);
            }
            let n = want.min(have);
            self.stage[self.stage_len..self.stage_len + n]
                .copy_from_slice(&input[consumed..consumed + n]);
            self.stage_len += n;
            consumed += n;
        }
    }
}

/// Length-prefixed UTF-8 element: a `u32` byte count, then the bytes.
pub struct StringDecoder {
    length_stage: [u8; 4],
    length_filled: usize,
    payload: Vec<u8>,
    payload_needed: Option<usize>,
    record_count: u64,
    emitted: u64,
}

impl StringDecoder {
    fn new(record_count: u64) -> Self {
        Self {
            length_stage: [0u8; 4],
            length_filled: 0,
            payload: Vec::new(),
            payload_needed: None,
            record_count,
            emitted: 0,
        }
    }

    fn input_process(&mut self, binding: &BufferBinding, input: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        loop {
            if self.emitted >= self.record_count {
                return Ok(input.len());
            }

            let Some(needed) = self.payload_needed else {
                if self.length_filled == 4 {
                    self.payload_needed = Some(u32::from_le_bytes(self.length_stage) as usize);
                    self.payload.clear();
                    self.length_filled = 0;
                    continue;
                }
                if consumed == input.len() {
                    return Ok(consumed);
                }
                self.length_stage[self.length_filled] = input[consumed];
                self.length_filled += 1;
                consumed += 1;
                continue;
            };

            if self.payload.len() == needed {
                if binding.is_full() {
                    return Ok(consumed);
                }
                let bytes = std::mem::take(&mut self.payload);
                let value = String::from_utf8(bytes).map_err(|_| Error::BadPacket {
                    context: format!("string bytestream is not valid UTF-8 at record {}", self.emitted),
                })?;
                binding.store_str(value)?;
                self.payload_needed = None;
                self.emitted += 1;
                continue;
            }

            let want = needed - self.payload.len();
            let have = input.len() - consumed;
            if have == 0 {
                return Ok(consumed);
            }
            let n = want.min(have);
            self.payload.extend_from_slice(&input[consumed..consumed + n]);
            consumed += n;
        }
    }
}
