//! Descriptor - one keyed binary record and its lifecycle
//!
//! A descriptor only ever comes out of the manager fully prepared, with its
//! payload attached as a [`DataStream`]. From there:
//!
//! ```text
//! Prepared --write--> Dirty --persist--> Prepared
//!     \                 \
//!      +----release-----+--> Released
//!                              (failed release --> Undefined)
//! ```
//!
//! Every accessor fails with [`Error::UndefinedState`] once the descriptor
//! is `Released` or `Undefined`.

use crate::manager::StorageManager;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Descriptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Payload matches the stored row
    Prepared,
    /// Payload changed in memory and has not been persisted
    Dirty,
    /// Stream disposed; the descriptor is finished
    Released,
    /// A release failed part-way; the descriptor must not be reused
    Undefined,
}

impl DescriptorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorState::Prepared => "prepared",
            DescriptorState::Dirty => "dirty",
            DescriptorState::Released => "released",
            DescriptorState::Undefined => "undefined",
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, DescriptorState::Prepared | DescriptorState::Dirty)
    }
}

/// In-memory payload stream with a hard size limit.
///
/// Reads, writes and seeks behave like a file of at most `limit` bytes.
#[derive(Debug, Clone)]
pub struct DataStream {
    cursor: Cursor<Vec<u8>>,
    limit: usize,
}

impl DataStream {
    pub fn new(data: Vec<u8>, limit: usize) -> Self {
        Self {
            cursor: Cursor::new(data),
            limit,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between the cursor and the end of the payload
    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.cursor.position() as usize)
    }

    /// Replace the payload and rewind
    fn reset(&mut self, data: Vec<u8>) {
        self.cursor = Cursor::new(data);
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for DataStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.cursor.position() as usize + buf.len();
        if end > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write would grow payload to {end} bytes, limit is {}", self.limit),
            ));
        }
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for DataStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

/// One keyed binary record, owned by the caller until released
#[derive(Debug)]
pub struct Descriptor {
    manager: StorageManager,
    id: String,
    owner: String,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    stream: Option<DataStream>,
    state: DescriptorState,
    remove_on_release: bool,
}

impl Descriptor {
    /// Only the manager builds descriptors, always with their payload attached.
    pub(crate) fn prepared(
        manager: StorageManager,
        id: String,
        owner: String,
        created: DateTime<Utc>,
        last_modified: DateTime<Utc>,
        data: Vec<u8>,
    ) -> Self {
        let limit = manager.max_data_size();
        Self {
            manager,
            id,
            owner,
            created,
            last_modified,
            stream: Some(DataStream::new(data, limit)),
            state: DescriptorState::Prepared,
            remove_on_release: false,
        }
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.state.is_live() {
            Ok(())
        } else {
            Err(Error::UndefinedState(format!(
                "descriptor {} is {}",
                self.id,
                self.state.as_str()
            )))
        }
    }

    /// Primary key regardless of state
    pub(crate) fn key(&self) -> &str {
        &self.id
    }

    pub(crate) fn modified_at(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Record a successful write made by the manager
    pub(crate) fn apply_persisted(&mut self, data: &[u8], modified: DateTime<Utc>) {
        if let Some(stream) = self.stream.as_mut() {
            if stream.as_slice() != data {
                stream.reset(data.to_vec());
            }
        }
        self.last_modified = modified;
        self.state = DescriptorState::Prepared;
    }

    fn live_stream(&self) -> Result<&DataStream> {
        self.ensure_usable()?;
        self.stream
            .as_ref()
            .ok_or_else(|| Error::UndefinedState(format!("descriptor {} has no data stream", self.id)))
    }

    fn live_stream_mut(&mut self) -> Result<&mut DataStream> {
        self.ensure_usable()?;
        let id = &self.id;
        self.stream
            .as_mut()
            .ok_or_else(|| Error::UndefinedState(format!("descriptor {id} has no data stream")))
    }

    // ========== Accessors ==========

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn id(&self) -> Result<&str> {
        self.ensure_usable()?;
        Ok(&self.id)
    }

    pub fn owner(&self) -> Result<&str> {
        self.ensure_usable()?;
        Ok(&self.owner)
    }

    pub fn created(&self) -> Result<DateTime<Utc>> {
        self.ensure_usable()?;
        Ok(self.created)
    }

    pub fn last_modified(&self) -> Result<DateTime<Utc>> {
        self.ensure_usable()?;
        Ok(self.last_modified)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self.state == DescriptorState::Dirty)
    }

    /// The full in-memory payload
    pub fn data(&self) -> Result<&[u8]> {
        Ok(self.live_stream()?.as_slice())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.live_stream()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.live_stream()?.is_empty())
    }

    // ========== Mutators ==========

    /// Direct access to the payload stream; counts as a modification.
    pub fn stream_mut(&mut self) -> Result<&mut DataStream> {
        self.live_stream_mut()?;
        self.state = DescriptorState::Dirty;
        self.live_stream_mut()
    }

    /// Replace the whole payload
    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        let stream = self.live_stream_mut()?;
        if data.len() > stream.limit() {
            return Err(Error::invalid(format!(
                "payload of {} bytes exceeds limit of {}",
                data.len(),
                stream.limit()
            )));
        }
        stream.reset(data);
        self.state = DescriptorState::Dirty;
        Ok(())
    }

    /// Append to the end of the payload
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.live_stream_mut()?;
        stream.seek(SeekFrom::End(0))?;
        stream
            .write_all(data)
            .map_err(|e| Error::invalid(e.to_string()))?;
        self.state = DescriptorState::Dirty;
        Ok(())
    }

    /// Ask for the row to be deleted when the descriptor is released
    pub fn mark_for_removal(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.remove_on_release = true;
        Ok(())
    }

    pub fn is_marked_for_removal(&self) -> bool {
        self.remove_on_release
    }

    // ========== Lifecycle ==========

    /// Write the payload back through the manager. No-op when nothing changed.
    pub async fn persist(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_usable()?;
        if self.state != DescriptorState::Dirty {
            return Ok(());
        }
        let data = self.live_stream()?.as_slice().to_vec();
        let manager = self.manager.clone();
        manager.update_descriptor_data(self, &data, cancel).await
    }

    /// Dispose the stream and, if requested, remove the row.
    ///
    /// Releasing twice is a no-op. A failed removal leaves the descriptor
    /// `Undefined`.
    pub async fn release(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            DescriptorState::Released => return Ok(()),
            DescriptorState::Undefined => return self.ensure_usable(),
            DescriptorState::Prepared | DescriptorState::Dirty => {}
        }

        let remove = self.remove_on_release;
        self.dispose_stream();

        if remove {
            let manager = self.manager.clone();
            if let Err(e) = manager.remove_descriptor(self, cancel).await {
                self.state = DescriptorState::Undefined;
                return Err(e);
            }
        }

        self.state = DescriptorState::Released;
        Ok(())
    }

    /// Synchronous best-effort release without touching the database
    pub fn dispose(&mut self) {
        if !self.state.is_live() {
            return;
        }
        if self.remove_on_release {
            tracing::warn!("Descriptor {} disposed without running its pending removal", self.id);
        }
        self.dispose_stream();
        self.state = DescriptorState::Released;
    }

    fn dispose_stream(&mut self) {
        if self.state == DescriptorState::Dirty {
            tracing::warn!("Releasing descriptor {} with unpersisted changes", self.id);
        }
        if let Some(stream) = self.stream.take() {
            if stream.remaining() > 0 {
                tracing::trace!(
                    "Descriptor {} stream disposed with {} unread bytes",
                    self.id,
                    stream.remaining()
                );
            }
        }
    }
}
