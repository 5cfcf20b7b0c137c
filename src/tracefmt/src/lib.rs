//! Wire format of the capture trace.
//!
//! A trace file is a gzip stream; after decompression it carries an 8-byte
//! header (magic + version) followed by a flat sequence of records. The same
//! record bytes flow through the shared trace buffer before they ever reach a
//! file, so this crate is used by both the producers (the preloaded shim) and
//! the consumer (the driver). Downstream build-analysis tooling reads the
//! format byte for byte; nothing here may change without a version bump.

use std::ffi::{CStr, CString};
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

mod access;

pub use access::Access;

/// First word of every decompressed trace stream.
pub const TRACE_MAGIC: u32 = 0xBEEF_FEED;

/// Bumped whenever the record layout changes.
pub const TRACE_VERSION: u32 = 1;

/// Record tags. One byte on the wire, followed by the four-byte process
/// number of the acting process and the kind-specific tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// A file existed before the build started (`-r` scan).
    Register = 1,
    FileWrite = 2,
    FileRead = 3,
    FileModify = 4,
    FileDelete = 5,
    /// Two paths: old name, new name. Kept for downstream compatibility;
    /// the rename shims emit a delete + create pair instead.
    FileRename = 6,
    /// Two paths: link source, link name.
    FileNewLink = 7,
    /// Parent number, cwd, argv and environment of a freshly exec'ed program.
    NewProgram = 8,
    DirWrite = 9,
    DirRead = 10,
    DirModify = 11,
    DirDelete = 12,
}

impl EventKind {
    pub fn from_raw(raw: u8) -> Option<EventKind> {
        Some(match raw {
            1 => EventKind::Register,
            2 => EventKind::FileWrite,
            3 => EventKind::FileRead,
            4 => EventKind::FileModify,
            5 => EventKind::FileDelete,
            6 => EventKind::FileRename,
            7 => EventKind::FileNewLink,
            8 => EventKind::NewProgram,
            9 => EventKind::DirWrite,
            10 => EventKind::DirRead,
            11 => EventKind::DirModify,
            12 => EventKind::DirDelete,
            _ => return None,
        })
    }

    fn path_count(self) -> usize {
        match self {
            EventKind::FileRename | EventKind::FileNewLink => 2,
            EventKind::NewProgram => 0,
            _ => 1,
        }
    }
}

/// One decoded (or to-be-encoded) trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// All single-path records: register, file/dir read/write/modify/delete.
    Path {
        kind: EventKind,
        process: u32,
        path: CString,
    },
    /// `FILE_RENAME` and `FILE_NEW_LINK`.
    TwoPath {
        kind: EventKind,
        process: u32,
        first: CString,
        second: CString,
    },
    /// A new program image started under the tracer.
    NewProgram {
        process: u32,
        parent: u32,
        cwd: CString,
        args: Vec<CString>,
        env: Vec<CString>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Path { kind, .. } | Event::TwoPath { kind, .. } => *kind,
            Event::NewProgram { .. } => EventKind::NewProgram,
        }
    }

    pub fn process(&self) -> u32 {
        match self {
            Event::Path { process, .. }
            | Event::TwoPath { process, .. }
            | Event::NewProgram { process, .. } => *process,
        }
    }

    /// Serialize into any [`EventSink`]. The caller is responsible for
    /// whatever atomicity the sink requires; the trace buffer guard holds the
    /// master lock for exactly this reason.
    pub fn write_to<S: EventSink>(&self, sink: &mut S) -> Result<(), S::Error> {
        match self {
            Event::Path {
                kind,
                process,
                path,
            } => {
                sink.put_byte(*kind as u8)?;
                sink.put_u32(*process)?;
                sink.put_cstr(path)?;
            }
            Event::TwoPath {
                kind,
                process,
                first,
                second,
            } => {
                sink.put_byte(*kind as u8)?;
                sink.put_u32(*process)?;
                sink.put_cstr(first)?;
                sink.put_cstr(second)?;
            }
            Event::NewProgram {
                process,
                parent,
                cwd,
                args,
                env,
            } => {
                sink.put_byte(EventKind::NewProgram as u8)?;
                sink.put_u32(*process)?;
                sink.put_u32(*parent)?;
                sink.put_cstr(cwd)?;
                sink.put_u32(args.len() as u32)?;
                for arg in args {
                    sink.put_cstr(arg)?;
                }
                for var in env {
                    sink.put_cstr(var)?;
                }
                // empty string closes the environment block
                sink.put_byte(0)?;
            }
        }
        Ok(())
    }
}

/// Destination for encoded records. Implemented by the trace buffer's write
/// guard and, below, by any `io::Write` for tests and offline tooling.
pub trait EventSink {
    type Error;

    fn put_byte(&mut self, byte: u8) -> Result<(), Self::Error>;
    fn put_u32(&mut self, value: u32) -> Result<(), Self::Error>;
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// String bytes followed by a terminating NUL.
    fn put_cstr(&mut self, s: &CStr) -> Result<(), Self::Error> {
        self.put_bytes(s.to_bytes_with_nul())
    }
}

/// Adapts an `io::Write` into an [`EventSink`].
pub struct WriteSink<W>(pub W);

impl<W: Write> EventSink for WriteSink<W> {
    type Error = io::Error;

    fn put_byte(&mut self, byte: u8) -> Result<(), io::Error> {
        self.0.write_all(&[byte])
    }

    fn put_u32(&mut self, value: u32) -> Result<(), io::Error> {
        self.0.write_u32::<LittleEndian>(value)
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), io::Error> {
        self.0.write_all(bytes)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a trace file (magic {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported trace version {0}")]
    BadVersion(u32),
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("truncated record")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Write the decompressed-stream header (magic then version).
pub fn write_header<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_u32::<LittleEndian>(TRACE_MAGIC)?;
    out.write_u32::<LittleEndian>(TRACE_VERSION)
}

/// Read and validate the stream header.
pub fn read_header<R: Read>(input: &mut R) -> Result<(), ParseError> {
    let magic = input.read_u32::<LittleEndian>()?;
    if magic != TRACE_MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let version = input.read_u32::<LittleEndian>()?;
    if version != TRACE_VERSION {
        return Err(ParseError::BadVersion(version));
    }
    Ok(())
}

/// Parse a headerless record sequence, e.g. the payload drained from the
/// trace buffer. The slice must end on a record boundary.
pub fn parse_payload(bytes: &[u8]) -> Result<Vec<Event>, ParseError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let mut events = Vec::new();
    while cursor.pos < cursor.bytes.len() {
        events.push(parse_event(&mut cursor)?);
    }
    Ok(events)
}

/// Read a full decompressed trace: header plus records until EOF.
pub fn read_trace<R: Read>(mut input: R) -> Result<Vec<Event>, ParseError> {
    read_header(&mut input)?;
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    parse_payload(&bytes)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, ParseError> {
        let b = *self.bytes.get(self.pos).ok_or(ParseError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let end = self.pos.checked_add(4).ok_or(ParseError::Truncated)?;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or(ParseError::Truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn cstring(&mut self) -> Result<CString, ParseError> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParseError::Truncated)?;
        let s = CString::new(&rest[..nul]).expect("no interior NUL");
        self.pos += nul + 1;
        Ok(s)
    }
}

fn parse_event(cursor: &mut Cursor<'_>) -> Result<Event, ParseError> {
    let raw = cursor.u8()?;
    let kind = EventKind::from_raw(raw).ok_or(ParseError::UnknownKind(raw))?;
    let process = cursor.u32()?;

    if kind == EventKind::NewProgram {
        let parent = cursor.u32()?;
        let cwd = cursor.cstring()?;
        let argc = cursor.u32()?;
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(cursor.cstring()?);
        }
        let mut env = Vec::new();
        loop {
            let var = cursor.cstring()?;
            if var.as_bytes().is_empty() {
                break;
            }
            env.push(var);
        }
        return Ok(Event::NewProgram {
            process,
            parent,
            cwd,
            args,
            env,
        });
    }

    match kind.path_count() {
        2 => Ok(Event::TwoPath {
            kind,
            process,
            first: cursor.cstring()?,
            second: cursor.cstring()?,
        }),
        _ => Ok(Event::Path {
            kind,
            process,
            path: cursor.cstring()?,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cs(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn encode(events: &[Event]) -> Vec<u8> {
        let mut sink = WriteSink(Vec::new());
        for ev in events {
            ev.write_to(&mut sink).unwrap();
        }
        sink.0
    }

    #[test]
    fn kind_codes_match_the_wire_contract() {
        assert_eq!(EventKind::Register as u8, 1);
        assert_eq!(EventKind::FileNewLink as u8, 7);
        assert_eq!(EventKind::NewProgram as u8, 8);
        assert_eq!(EventKind::DirDelete as u8, 12);
        assert_eq!(EventKind::from_raw(3), Some(EventKind::FileRead));
        assert_eq!(EventKind::from_raw(0), None);
        assert_eq!(EventKind::from_raw(13), None);
    }

    #[test]
    fn path_record_layout() {
        let bytes = encode(&[Event::Path {
            kind: EventKind::FileWrite,
            process: 7,
            path: cs("/tmp/x"),
        }]);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &[7, 0, 0, 0]);
        assert_eq!(&bytes[5..], b"/tmp/x\0");
    }

    #[test]
    fn round_trips_every_record_shape() {
        let events = vec![
            Event::Path {
                kind: EventKind::Register,
                process: 0,
                path: cs("/src/main.c"),
            },
            Event::NewProgram {
                process: 1,
                parent: 0,
                cwd: cs("/home/u/p"),
                args: vec![cs("/bin/sh"), cs("-c"), cs("echo hi")],
                env: vec![cs("PATH=/bin"), cs("CFS_ID=42")],
            },
            Event::TwoPath {
                kind: EventKind::FileNewLink,
                process: 2,
                first: cs("/a/src"),
                second: cs("/a/link"),
            },
            Event::Path {
                kind: EventKind::DirDelete,
                process: 3,
                path: cs("/a/b"),
            },
        ];
        let parsed = parse_payload(&encode(&events)).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn new_program_env_block_has_explicit_terminator() {
        let ev = Event::NewProgram {
            process: 1,
            parent: 0,
            cwd: cs("/"),
            args: vec![cs("/bin/true")],
            env: vec![],
        };
        let bytes = encode(&[ev]);
        // ...argc, argv[0], then the lone terminator byte
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(&bytes[bytes.len() - 2..], b"\0\0");
        // and it still parses as exactly one record
        assert_eq!(parse_payload(&bytes).unwrap().len(), 1);
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(&buf[..4], &0xBEEF_FEEDu32.to_le_bytes());
        assert_eq!(&buf[4..], &1u32.to_le_bytes());
        read_header(&mut &buf[..]).unwrap();
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            read_header(&mut &buf[..]),
            Err(ParseError::BadMagic(0xDEAD_BEEF))
        ));

        let mut buf = Vec::new();
        buf.extend_from_slice(&TRACE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            read_header(&mut &buf[..]),
            Err(ParseError::BadVersion(99))
        ));
    }

    #[test]
    fn truncated_and_unknown_records_fail_cleanly() {
        let full = encode(&[Event::Path {
            kind: EventKind::FileRead,
            process: 1,
            path: cs("/x"),
        }]);
        for cut in 1..full.len() {
            assert!(parse_payload(&full[..cut]).is_err());
        }
        assert!(matches!(
            parse_payload(&[200, 0, 0, 0, 0]),
            Err(ParseError::UnknownKind(200))
        ));
    }
}
