//! Image file and compressed vector handles
//!
//! The image file owns the paged file and a count of open readers, so a
//! close during teardown can tell whether a section is still being drained.
//! Compressed vectors hold only a weak reference back to their image file;
//! it is upgraded for the duration of a call, which keeps ownership strictly
//! parent to child.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::debug;

use crate::binding::BufferBinding;
use crate::cache::DEFAULT_CACHE_SLOTS;
use crate::paged_file::PagedFile;
use crate::prototype::Prototype;
use crate::reader::CompressedVectorReader;
use crate::{Error, Result};

pub(crate) struct ImageFileState {
    path: PathBuf,
    file: Rc<RefCell<PagedFile>>,
    reader_count: Cell<usize>,
    open: Cell<bool>,
}

/// Handle to an open E57 image file; clones share the same state.
#[derive(Clone)]
pub struct ImageFile {
    state: Rc<ImageFileState>,
}

impl ImageFile {
    /// Open an image file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = PagedFile::open(&path)?;
        debug!("opened image file {:?}", path);

        Ok(Self {
            state: Rc::new(ImageFileState {
                path,
                file: Rc::new(RefCell::new(file)),
                reader_count: Cell::new(0),
                open: Cell::new(true),
            }),
        })
    }

    /// Path this image file was opened from.
    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.state.open.get()
    }

    /// Number of readers currently draining sections of this file.
    pub fn reader_count(&self) -> usize {
        self.state.reader_count.get()
    }

    /// Close the image file. Fails while readers are still open.
    pub fn close(&self) -> Result<()> {
        if self.state.reader_count.get() > 0 {
            return Err(Error::BadApiArgument {
                context: format!(
                    "cannot close {:?} with {} open readers",
                    self.state.path,
                    self.state.reader_count.get()
                ),
            });
        }
        debug!("closed image file {:?}", self.state.path);
        self.state.open.set(false);
        Ok(())
    }

    pub(crate) fn check_open(&self, context: &str) -> Result<()> {
        if !self.state.open.get() {
            return Err(Error::ImageFileNotOpen {
                context: format!("imageFile={:?} {context}", self.state.path),
            });
        }
        Ok(())
    }

    pub(crate) fn incr_reader_count(&self) {
        self.state.reader_count.set(self.state.reader_count.get() + 1);
    }

    pub(crate) fn decr_reader_count(&self) {
        let count = self.state.reader_count.get();
        self.state.reader_count.set(count.saturating_sub(1));
    }

    pub(crate) fn file(&self) -> Rc<RefCell<PagedFile>> {
        Rc::clone(&self.state.file)
    }

    fn downgrade(&self) -> Weak<ImageFileState> {
        Rc::downgrade(&self.state)
    }
}

struct VectorState {
    image_file: Weak<ImageFileState>,
    image_file_name: String,
    path_name: String,
    prototype: Prototype,
    record_count: u64,
    section_logical_start: u64,
}

/// Handle to one compressed vector inside an image file.
///
/// In a complete reader this is produced by the XML header parser; the
/// constructor takes the facts that parser would have extracted.
#[derive(Clone)]
pub struct CompressedVector {
    state: Rc<VectorState>,
}

impl CompressedVector {
    /// Describe a compressed vector whose binary section starts at
    /// `section_logical_start` and holds `record_count` records.
    pub fn new(
        image_file: &ImageFile,
        path_name: &str,
        prototype: Prototype,
        record_count: u64,
        section_logical_start: u64,
    ) -> Self {
        Self {
            state: Rc::new(VectorState {
                image_file: image_file.downgrade(),
                image_file_name: image_file.path().display().to_string(),
                path_name: path_name.to_string(),
                prototype,
                record_count,
                section_logical_start,
            }),
        }
    }

    /// Record schema shared by every record in this vector.
    pub fn prototype(&self) -> &Prototype {
        &self.state.prototype
    }

    /// Number of records in the vector.
    pub fn record_count(&self) -> u64 {
        self.state.record_count
    }

    /// Path of this vector's node in the image file tree.
    pub fn path_name(&self) -> &str {
        &self.state.path_name
    }

    pub(crate) fn section_logical_start(&self) -> u64 {
        self.state.section_logical_start
    }

    /// Diagnostic context naming the file and vector, attached to failures.
    pub(crate) fn error_context(&self) -> String {
        format!(
            "imageFile={} cvPathName={}",
            self.state.image_file_name, self.state.path_name
        )
    }

    /// Upgrade the weak back-reference for the duration of a call.
    pub(crate) fn image_file(&self) -> Result<ImageFile> {
        match self.state.image_file.upgrade() {
            Some(state) => Ok(ImageFile { state }),
            None => Err(Error::ImageFileNotOpen {
                context: self.error_context(),
            }),
        }
    }

    /// Open a reader that materializes records into `bindings`.
    pub fn reader(&self, bindings: &[BufferBinding]) -> Result<CompressedVectorReader> {
        CompressedVectorReader::open(self.clone(), bindings, DEFAULT_CACHE_SLOTS)
    }

    /// Like [`reader`](Self::reader) with an explicit packet cache size.
    pub fn reader_with_cache_slots(
        &self,
        bindings: &[BufferBinding],
        cache_slots: usize,
    ) -> Result<CompressedVectorReader> {
        CompressedVectorReader::open(self.clone(), bindings, cache_slots)
    }
}
