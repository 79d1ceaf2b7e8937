//! Destination buffer bindings
//!
//! A [`BufferBinding`] pairs one prototype element with a caller-visible
//! destination: a strided byte region for the numeric representations, or a
//! shared string vector for string elements. Bindings are cheap handles
//! (clones share state), so the caller keeps one and reads values back after
//! a transfer while the reader writes through its own clone.
//!
//! Conversions between the integer, float and boolean groups must be opted
//! into with `do_conversion`; string buffers never convert. Both rules are
//! enforced on the first transfer, not at construction.

use std::cell::RefCell;
use std::rc::Rc;

use crate::image_file::ImageFile;
use crate::{Error, Result};

/// Shared destination for string element transfers.
pub type StringVec = Rc<RefCell<Vec<String>>>;

/// In-memory element representation of a binding.
///
/// The set is closed: these are the representations the ASTM standard allows
/// a transfer buffer to have (there is no unsigned 64-bit variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRepr {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    Bool,
    Real32,
    Real64,
    UString,
}

impl MemoryRepr {
    /// Size in bytes of one element, zero for strings.
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Real32 => 4,
            Self::Int64 | Self::Real64 => 8,
            Self::UString => 0,
        }
    }

    fn integer_bounds(self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::UInt8 => Some((0, u8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::UInt16 => Some((0, u16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::UInt32 => Some((0, u32::MAX as i64)),
            Self::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

enum DestStore {
    Bytes(Box<[u8]>),
    Strings(StringVec),
}

struct BindingState {
    path_name: String,
    repr: MemoryRepr,
    capacity: usize,
    stride: usize,
    do_conversion: bool,
    do_scaling: bool,
    next_index: usize,
    store: DestStore,
}

impl BindingState {
    fn slot(&mut self) -> Result<usize> {
        if self.next_index >= self.capacity {
            return Err(Error::Internal {
                context: format!("write past capacity of buffer for {}", self.path_name),
                detail: self.capacity as u64,
            });
        }
        Ok(self.next_index)
    }

    fn put_bytes(&mut self, index: usize, bytes: &[u8]) {
        let at = index * self.stride;
        match &mut self.store {
            DestStore::Bytes(data) => data[at..at + bytes.len()].copy_from_slice(bytes),
            DestStore::Strings(_) => unreachable!("numeric store on string binding"),
        }
    }

    fn get_bytes(&self, index: usize, len: usize) -> &[u8] {
        let at = index * self.stride;
        match &self.store {
            DestStore::Bytes(data) => &data[at..at + len],
            DestStore::Strings(_) => unreachable!("numeric load on string binding"),
        }
    }
}

/// Handle to one destination buffer; clones share the same state.
#[derive(Clone)]
pub struct BufferBinding {
    state: Rc<RefCell<BindingState>>,
}

impl BufferBinding {
    /// Bind a strided numeric destination of `capacity` elements.
    ///
    /// `stride` is in bytes; zero means "element size". The representation
    /// tag is fixed for the binding's lifetime.
    pub fn new(
        image_file: &ImageFile,
        path_name: &str,
        repr: MemoryRepr,
        capacity: usize,
        do_conversion: bool,
        do_scaling: bool,
        stride: usize,
    ) -> Result<Self> {
        image_file.check_open(path_name)?;

        if repr == MemoryRepr::UString {
            return Err(Error::BadApiArgument {
                context: format!("string buffer for {path_name} must use BufferBinding::strings"),
            });
        }
        if capacity == 0 {
            return Err(Error::BadApiArgument {
                context: format!("zero capacity buffer for {path_name}"),
            });
        }

        let element_size = repr.element_size();
        let stride = if stride == 0 { element_size } else { stride };
        if stride < element_size {
            return Err(Error::BadApiArgument {
                context: format!(
                    "stride {stride} smaller than element size {element_size} for {path_name}"
                ),
            });
        }

        Ok(Self {
            state: Rc::new(RefCell::new(BindingState {
                path_name: path_name.to_string(),
                repr,
                capacity,
                stride,
                do_conversion,
                do_scaling,
                next_index: 0,
                store: DestStore::Bytes(vec![0u8; capacity * stride].into_boxed_slice()),
            })),
        })
    }

    /// Bind a shared string vector; its length is the capacity.
    pub fn strings(image_file: &ImageFile, path_name: &str, dest: StringVec) -> Result<Self> {
        image_file.check_open(path_name)?;

        let capacity = dest.borrow().len();
        if capacity == 0 {
            return Err(Error::BadApiArgument {
                context: format!("empty string vector bound to {path_name}"),
            });
        }

        Ok(Self {
            state: Rc::new(RefCell::new(BindingState {
                path_name: path_name.to_string(),
                repr: MemoryRepr::UString,
                capacity,
                stride: 0,
                do_conversion: false,
                do_scaling: false,
                next_index: 0,
                store: DestStore::Strings(dest),
            })),
        })
    }

    /// Prototype path this binding transfers to.
    pub fn path_name(&self) -> String {
        self.state.borrow().path_name.clone()
    }

    /// Fixed memory representation of the destination.
    pub fn memory_repr(&self) -> MemoryRepr {
        self.state.borrow().repr
    }

    /// Total element capacity.
    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    /// Bytes between consecutive elements (zero for strings).
    pub fn stride(&self) -> usize {
        self.state.borrow().stride
    }

    /// Whether cross-group conversion was requested.
    pub fn do_conversion(&self) -> bool {
        self.state.borrow().do_conversion
    }

    /// Whether scaled integer elements transfer as scaled values.
    pub fn do_scaling(&self) -> bool {
        self.state.borrow().do_scaling
    }

    /// Elements written since the last rewind.
    pub fn next_index(&self) -> usize {
        self.state.borrow().next_index
    }

    pub(crate) fn rewind(&self) {
        self.state.borrow_mut().next_index = 0;
    }

    pub(crate) fn is_full(&self) -> bool {
        let state = self.state.borrow();
        state.next_index >= state.capacity
    }

    /// Store one integer-group value, converting per the binding flags.
    pub(crate) fn store_i64(&self, value: i64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let index = state.slot()?;

        match state.repr {
            MemoryRepr::Int8 => store_integer(&mut state, index, value, |v| (v as i8).to_le_bytes())?,
            MemoryRepr::UInt8 => store_integer(&mut state, index, value, |v| (v as u8).to_le_bytes())?,
            MemoryRepr::Int16 => store_integer(&mut state, index, value, |v| (v as i16).to_le_bytes())?,
            MemoryRepr::UInt16 => store_integer(&mut state, index, value, |v| (v as u16).to_le_bytes())?,
            MemoryRepr::Int32 => store_integer(&mut state, index, value, |v| (v as i32).to_le_bytes())?,
            MemoryRepr::UInt32 => store_integer(&mut state, index, value, |v| (v as u32).to_le_bytes())?,
            MemoryRepr::Int64 => store_integer(&mut state, index, value, |v| v.to_le_bytes())?,
            MemoryRepr::Bool => {
                require_conversion(&state, "integer element into boolean buffer")?;
                state.put_bytes(index, &[(value != 0) as u8]);
            }
            MemoryRepr::Real32 => {
                require_conversion(&state, "integer element into float buffer")?;
                state.put_bytes(index, &(value as f32).to_le_bytes());
            }
            MemoryRepr::Real64 => {
                require_conversion(&state, "integer element into float buffer")?;
                state.put_bytes(index, &(value as f64).to_le_bytes());
            }
            MemoryRepr::UString => {
                return Err(Error::NoBufferForElement {
                    context: format!("integer element bound to string buffer {}", state.path_name),
                });
            }
        }

        state.next_index += 1;
        Ok(())
    }

    /// Store one float-group value, converting per the binding flags.
    pub(crate) fn store_f64(&self, value: f64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let index = state.slot()?;

        match state.repr {
            MemoryRepr::Real32 => state.put_bytes(index, &(value as f32).to_le_bytes()),
            MemoryRepr::Real64 => state.put_bytes(index, &value.to_le_bytes()),
            MemoryRepr::Bool => {
                require_conversion(&state, "float element into boolean buffer")?;
                state.put_bytes(index, &[(value != 0.0) as u8]);
            }
            MemoryRepr::UString => {
                return Err(Error::NoBufferForElement {
                    context: format!("float element bound to string buffer {}", state.path_name),
                });
            }
            _ => {
                require_conversion(&state, "float element into integer buffer")?;
                let (min, max) = state.repr.integer_bounds().expect("integer repr");
                let truncated = value.trunc();
                if !truncated.is_finite() || truncated < min as f64 || truncated > max as f64 {
                    return Err(Error::ValueOutOfRange {
                        context: format!(
                            "value {value} does not fit {:?} buffer for {}",
                            state.repr, state.path_name
                        ),
                    });
                }
                let as_int = truncated as i64;
                match state.repr {
                    MemoryRepr::Int8 => state.put_bytes(index, &(as_int as i8).to_le_bytes()),
                    MemoryRepr::UInt8 => state.put_bytes(index, &(as_int as u8).to_le_bytes()),
                    MemoryRepr::Int16 => state.put_bytes(index, &(as_int as i16).to_le_bytes()),
                    MemoryRepr::UInt16 => state.put_bytes(index, &(as_int as u16).to_le_bytes()),
                    MemoryRepr::Int32 => state.put_bytes(index, &(as_int as i32).to_le_bytes()),
                    MemoryRepr::UInt32 => state.put_bytes(index, &(as_int as u32).to_le_bytes()),
                    MemoryRepr::Int64 => state.put_bytes(index, &as_int.to_le_bytes()),
                    _ => unreachable!(),
                }
            }
        }

        state.next_index += 1;
        Ok(())
    }

    /// Store one string value.
    pub(crate) fn store_str(&self, value: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let index = state.slot()?;

        match &state.store {
            DestStore::Strings(dest) => dest.borrow_mut()[index] = value,
            DestStore::Bytes(_) => {
                return Err(Error::NoBufferForElement {
                    context: format!(
                        "string element bound to {:?} buffer {}",
                        state.repr, state.path_name
                    ),
                });
            }
        }

        state.next_index += 1;
        Ok(())
    }

    /// Read back an integer-group element written by a transfer.
    pub fn value_i64(&self, index: usize) -> Result<i64> {
        let state = self.state.borrow();
        if index >= state.capacity {
            return Err(Error::BadApiArgument {
                context: format!("index {index} past capacity {}", state.capacity),
            });
        }

        let value = match state.repr {
            MemoryRepr::Int8 => i8::from_le_bytes(pull(state.get_bytes(index, 1))) as i64,
            MemoryRepr::UInt8 => u8::from_le_bytes(pull(state.get_bytes(index, 1))) as i64,
            MemoryRepr::Int16 => i16::from_le_bytes(pull(state.get_bytes(index, 2))) as i64,
            MemoryRepr::UInt16 => u16::from_le_bytes(pull(state.get_bytes(index, 2))) as i64,
            MemoryRepr::Int32 => i32::from_le_bytes(pull(state.get_bytes(index, 4))) as i64,
            MemoryRepr::UInt32 => u32::from_le_bytes(pull(state.get_bytes(index, 4))) as i64,
            MemoryRepr::Int64 => i64::from_le_bytes(pull(state.get_bytes(index, 8))),
            MemoryRepr::Bool => (state.get_bytes(index, 1)[0] != 0) as i64,
            _ => {
                return Err(Error::BadApiArgument {
                    context: format!("{:?} buffer has no integer view", state.repr),
                })
            }
        };
        Ok(value)
    }

    /// Read back a float-group element written by a transfer.
    pub fn value_f64(&self, index: usize) -> Result<f64> {
        let state = self.state.borrow();
        if index >= state.capacity {
            return Err(Error::BadApiArgument {
                context: format!("index {index} past capacity {}", state.capacity),
            });
        }

        let value = match state.repr {
            MemoryRepr::Real32 => f32::from_le_bytes(pull(state.get_bytes(index, 4))) as f64,
            MemoryRepr::Real64 => f64::from_le_bytes(pull(state.get_bytes(index, 8))),
            _ => {
                return Err(Error::BadApiArgument {
                    context: format!("{:?} buffer has no float view", state.repr),
                })
            }
        };
        Ok(value)
    }

    /// Error unless `other` could stand in for this binding on a later read.
    pub(crate) fn check_compatible(&self, other: &BufferBinding) -> Result<()> {
        let a = self.state.borrow();
        let b = other.state.borrow();

        let mismatch = |what: &str| {
            Err(Error::BuffersNotCompatible {
                context: format!("{what} changed for {}", a.path_name),
            })
        };

        if a.path_name != b.path_name {
            return Err(Error::BuffersNotCompatible {
                context: format!("pathName {} replaced by {}", a.path_name, b.path_name),
            });
        }
        if a.repr != b.repr {
            return mismatch("memory representation");
        }
        if a.capacity != b.capacity {
            return mismatch("capacity");
        }
        if a.do_conversion != b.do_conversion {
            return mismatch("doConversion");
        }
        if a.do_scaling != b.do_scaling {
            return mismatch("doScaling");
        }
        if a.stride != b.stride {
            return mismatch("stride");
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("BufferBinding")
            .field("path_name", &state.path_name)
            .field("repr", &state.repr)
            .field("capacity", &state.capacity)
            .field("next_index", &state.next_index)
            .finish()
    }
}

fn pull<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn require_conversion(state: &BindingState, what: &str) -> Result<()> {
    if !state.do_conversion {
        return Err(Error::ConversionRequired {
            context: format!("{what} {} without doConversion", state.path_name),
        });
    }
    Ok(())
}

fn store_integer<const N: usize>(
    state: &mut BindingState,
    index: usize,
    value: i64,
    encode: impl Fn(i64) -> [u8; N],
) -> Result<()> {
    let (min, max) = state.repr.integer_bounds().expect("integer repr");
    if value < min || value > max {
        return Err(Error::ValueOutOfRange {
            context: format!(
                "value {value} does not fit {:?} buffer for {}",
                state.repr, state.path_name
            ),
        });
    }
    state.put_bytes(index, &encode(value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_file::ImageFile;
    use crate::paged_file::PagedWriter;

    fn test_image_file() -> (tempfile::TempDir, ImageFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.e57");
        let writer = PagedWriter::create(&path).unwrap();
        writer.finish().unwrap();
        let imf = ImageFile::open(&path).unwrap();
        (dir, imf)
    }

    #[test]
    fn test_integer_range_check() {
        let (_dir, imf) = test_image_file();
        let binding =
            BufferBinding::new(&imf, "intensity", MemoryRepr::Int16, 4, false, false, 0).unwrap();

        binding.store_i64(-32768).unwrap();
        binding.store_i64(32767).unwrap();
        let err = binding.store_i64(40000).unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange { .. }), "actual error: {err:?}");

        assert_eq!(binding.next_index(), 2);
        assert_eq!(binding.value_i64(0).unwrap(), -32768);
        assert_eq!(binding.value_i64(1).unwrap(), 32767);
    }

    #[test]
    fn test_conversion_gating() {
        let (_dir, imf) = test_image_file();

        let plain =
            BufferBinding::new(&imf, "x", MemoryRepr::Real64, 2, false, false, 0).unwrap();
        let err = plain.store_i64(7).unwrap_err();
        assert!(matches!(err, Error::ConversionRequired { .. }), "actual error: {err:?}");

        let converting =
            BufferBinding::new(&imf, "x", MemoryRepr::Real64, 2, true, false, 0).unwrap();
        converting.store_i64(7).unwrap();
        assert_eq!(converting.value_f64(0).unwrap(), 7.0);

        let narrow = BufferBinding::new(&imf, "x", MemoryRepr::Int8, 2, true, false, 0).unwrap();
        narrow.store_f64(12.9).unwrap();
        assert_eq!(narrow.value_i64(0).unwrap(), 12);
        let err = narrow.store_f64(400.0).unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_string_isolation() {
        let (_dir, imf) = test_image_file();

        let dest: StringVec = Rc::new(RefCell::new(vec![String::new(); 2]));
        let strings = BufferBinding::strings(&imf, "label", Rc::clone(&dest)).unwrap();
        let err = strings.store_i64(1).unwrap_err();
        assert!(matches!(err, Error::NoBufferForElement { .. }), "actual error: {err:?}");

        strings.store_str("hello".to_string()).unwrap();
        assert_eq!(dest.borrow()[0], "hello");

        let numeric = BufferBinding::new(&imf, "label", MemoryRepr::Int32, 2, true, false, 0).unwrap();
        let err = numeric.store_str("oops".to_string()).unwrap_err();
        assert!(matches!(err, Error::NoBufferForElement { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_stride_layout() {
        let (_dir, imf) = test_image_file();

        // Elements 12 bytes apart, as if picking one field out of a struct array
        let binding =
            BufferBinding::new(&imf, "x", MemoryRepr::Int32, 3, false, false, 12).unwrap();
        binding.store_i64(10).unwrap();
        binding.store_i64(-20).unwrap();
        assert_eq!(binding.value_i64(0).unwrap(), 10);
        assert_eq!(binding.value_i64(1).unwrap(), -20);

        let err =
            BufferBinding::new(&imf, "x", MemoryRepr::Int32, 3, false, false, 2).unwrap_err();
        assert!(matches!(err, Error::BadApiArgument { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_rewind_and_overflow() {
        let (_dir, imf) = test_image_file();
        let binding =
            BufferBinding::new(&imf, "x", MemoryRepr::UInt8, 1, false, false, 0).unwrap();

        binding.store_i64(1).unwrap();
        assert!(binding.is_full());
        let err = binding.store_i64(2).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }), "actual error: {err:?}");

        binding.rewind();
        assert_eq!(binding.next_index(), 0);
        binding.store_i64(3).unwrap();
        assert_eq!(binding.value_i64(0).unwrap(), 3);
    }
}
