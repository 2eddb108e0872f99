//! Output segment queue.
//!
//! Replies are staged as a linked queue of fixed-capacity segments whose
//! entries are either owned byte runs or borrowed views into a
//! reference-counted tuple. A tuple entry keeps its strong handle until
//! the flusher has drained the segment, so index mutations can release a
//! tuple while a reply still points into it.
//!
//! A [`Mark`] freezes the queue position so a writer can reserve header
//! space, append the body, then patch the header length — or discard
//! everything written since the mark when a handler fails mid-reply.
//! Marks are only valid while no flush has consumed past them; handlers
//! never yield between taking a mark and resolving it.

use std::io::IoSlice;

use tidelog_core::tuple::TupleRef;

/// Entries per segment.
pub const NETMSG_IOV_SIZE: usize = 64;

/// Most slices handed to one vectored write.
pub const IOV_MAX: usize = 1024;

/// One staged output run.
enum OutEntry {
    /// Owned bytes (headers, small bodies)
    Owned(Vec<u8>),
    /// Borrowed view into a retained tuple
    Tuple {
        obj: TupleRef,
        offset: usize,
        len: usize,
    },
}

impl OutEntry {
    fn as_bytes(&self) -> &[u8] {
        match self {
            OutEntry::Owned(bytes) => bytes,
            OutEntry::Tuple { obj, offset, len } => &obj.as_bytes()[*offset..*offset + *len],
        }
    }

    fn len(&self) -> usize {
        match self {
            OutEntry::Owned(bytes) => bytes.len(),
            OutEntry::Tuple { len, .. } => *len,
        }
    }
}

struct Segment {
    entries: Vec<OutEntry>,
}

impl Segment {
    fn new() -> Segment {
        Segment {
            entries: Vec::with_capacity(NETMSG_IOV_SIZE),
        }
    }
}

/// Queue position snapshot for reserve-then-patch and error rewind.
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    segments: usize,
    entries: usize,
    bytes: usize,
}

/// Handle to a patchable `u32` inside an owned entry.
#[derive(Debug, Clone, Copy)]
pub struct PatchPoint {
    segment: usize,
    entry: usize,
    offset: usize,
}

/// The staged output of one connection.
#[derive(Default)]
pub struct MsgQueue {
    segments: Vec<Segment>,
    /// Bytes of the first entry already written by a partial flush.
    head_offset: usize,
    bytes: usize,
}

impl MsgQueue {
    /// Create an empty queue.
    pub fn new() -> MsgQueue {
        MsgQueue::default()
    }

    /// Total unflushed bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    fn push(&mut self, entry: OutEntry) {
        self.bytes += entry.len();
        match self.segments.last_mut() {
            Some(seg) if seg.entries.len() < NETMSG_IOV_SIZE => seg.entries.push(entry),
            _ => {
                let mut seg = Segment::new();
                seg.entries.push(entry);
                self.segments.push(seg);
            }
        }
    }

    /// Append owned bytes.
    pub fn add_owned(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.push(OutEntry::Owned(bytes));
        }
    }

    /// Append a view into a tuple, retaining the tuple until flushed.
    pub fn add_tuple(&mut self, obj: &TupleRef, offset: usize, len: usize) {
        assert!(offset + len <= obj.as_bytes().len(), "tuple view in range");
        if len != 0 {
            self.push(OutEntry::Tuple {
                obj: obj.clone(),
                offset,
                len,
            });
        }
    }

    /// Append owned bytes and return a patch handle to a `u32` at
    /// `offset` within them.
    pub fn add_patchable(&mut self, bytes: Vec<u8>, offset: usize) -> PatchPoint {
        assert!(offset + 4 <= bytes.len(), "patch point in range");
        self.push(OutEntry::Owned(bytes));
        let seg = self.segments.len() - 1;
        let entry = self.segments[seg].entries.len() - 1;
        PatchPoint {
            segment: seg,
            entry,
            offset,
        }
    }

    /// Overwrite the `u32` a patch point refers to.
    ///
    /// # Panics
    /// If the entry was flushed or rewound away.
    pub fn patch_u32(&mut self, point: PatchPoint, value: u32) {
        let entry = &mut self.segments[point.segment].entries[point.entry];
        match entry {
            OutEntry::Owned(bytes) => {
                bytes[point.offset..point.offset + 4].copy_from_slice(&value.to_le_bytes());
            }
            OutEntry::Tuple { .. } => panic!("patch point must refer to owned bytes"),
        }
    }

    /// Snapshot the current queue position.
    pub fn mark(&self) -> Mark {
        Mark {
            segments: self.segments.len(),
            entries: self.segments.last().map(|s| s.entries.len()).unwrap_or(0),
            bytes: self.bytes,
        }
    }

    /// Discard everything appended after the mark, dropping any tuple
    /// handles taken since.
    pub fn rewind(&mut self, mark: Mark) {
        assert!(mark.bytes <= self.bytes, "rewind requires an unflushed mark");
        self.segments.truncate(mark.segments);
        if let Some(seg) = self.segments.last_mut() {
            seg.entries.truncate(mark.entries);
        }
        self.bytes = mark.bytes;
    }

    /// Bytes appended since a mark was taken.
    pub fn bytes_since(&self, mark: Mark) -> usize {
        self.bytes - mark.bytes
    }

    /// Collect up to [`IOV_MAX`] slices for a vectored write.
    pub fn slices(&self) -> Vec<IoSlice<'_>> {
        let mut out = Vec::new();
        let mut first = true;
        'outer: for seg in &self.segments {
            for entry in &seg.entries {
                let bytes = entry.as_bytes();
                let bytes = if first {
                    first = false;
                    &bytes[self.head_offset..]
                } else {
                    bytes
                };
                if !bytes.is_empty() {
                    out.push(IoSlice::new(bytes));
                }
                if out.len() >= IOV_MAX {
                    break 'outer;
                }
            }
        }
        out
    }

    /// Release `n` flushed bytes from the head, dropping drained entries
    /// (and their tuple handles).
    pub fn consume(&mut self, mut n: usize) {
        assert!(n <= self.bytes, "consume past staged bytes");
        self.bytes -= n;
        n += self.head_offset;
        self.head_offset = 0;
        while n > 0 {
            let seg = &mut self.segments[0];
            let entry_len = seg.entries[0].len();
            if n >= entry_len {
                n -= entry_len;
                seg.entries.remove(0);
                if seg.entries.is_empty() {
                    self.segments.remove(0);
                    if self.segments.is_empty() {
                        assert_eq!(n, 0, "consume past staged bytes");
                        break;
                    }
                }
            } else {
                self.head_offset = n;
                break;
            }
        }
    }
}
